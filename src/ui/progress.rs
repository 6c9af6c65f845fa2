//! Progress bar for simulated workloads

use super::context::UiContext;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Tracks delivered jobs. Draws an indicatif bar on terminals and stays
/// silent otherwise.
pub struct SimulationProgress {
    bar: Option<ProgressBar>,
}

impl SimulationProgress {
    pub fn new(ctx: &UiContext, total: u64) -> Self {
        let bar = ctx.use_fancy_output().then(|| {
            let bar = ProgressBar::new(total);
            let style = ProgressStyle::with_template(
                "  {spinner:.cyan} {bar:30.cyan/dim} {pos}/{len} jobs {msg:.dim}  {elapsed:.dim}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
            .progress_chars("━╸─");
            bar.set_style(style);
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        Self { bar }
    }

    /// Update the delivered count and the number of jobs actually executed
    pub fn set_done(&self, delivered: u64, executed: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(delivered);
            bar.set_message(format!("{} executed", executed));
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = SimulationProgress::new(&ctx, 10);
        progress.set_done(5, 2);
        progress.finish();
    }
}
