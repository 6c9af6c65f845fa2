//! Terminal output for the `jobcache` binary
//!
//! Styled output on terminals, plain bracketed tags when piped or in CI.
//!
//! # Example
//!
//! ```rust,ignore
//! use jobcache::ui::{self, UiContext, SimulationProgress};
//!
//! let ctx = UiContext::detect();
//! ui::intro(&ctx, "Job cache simulation");
//!
//! let progress = SimulationProgress::new(&ctx, jobs);
//! progress.set_done(finished, executed);
//! progress.finish();
//!
//! ui::key_value(&ctx, "Hits", "42");
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, outro_success, outro_warn, section,
    step_ok_detail, step_warn_hint,
};
pub use progress::SimulationProgress;
