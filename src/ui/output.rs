//! Output helpers shared by the CLI commands

use super::context::UiContext;
use console::{style, Style};

/// Display a title line
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        println!("{} {}", style("◆").cyan(), style(title).cyan().bold());
    } else {
        println!("{}", title);
    }
    println!();
}

pub fn outro_success(ctx: &UiContext, message: &str) {
    println!();
    if ctx.use_fancy_output() {
        println!("{} {}", style("✓").green(), style(message).green().bold());
    } else {
        println!("[OK] {}", message);
    }
}

pub fn outro_warn(ctx: &UiContext, message: &str) {
    println!();
    if ctx.use_fancy_output() {
        println!("{} {}", style("!").yellow(), style(message).yellow().bold());
    } else {
        println!("[WARN] {}", message);
    }
}

/// Display a section header
pub fn section(ctx: &UiContext, title: &str) {
    println!();
    if ctx.use_fancy_output() {
        println!("{}", style(title).bold().underlined());
    } else {
        println!("{}", title);
    }
}

pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {} ({})", style("✓").green(), message, style(detail).dim());
    } else {
        println!("  [OK] {} ({})", message, detail);
    }
}

pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {} - {}", style("!").yellow(), message, style(hint).dim());
    } else {
        println!("  [WARN] {} - {}", message, hint);
    }
}

/// Print an aligned key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.use_fancy_output() {
        println!("  {:<22} {}", style(key).dim(), value);
    } else {
        println!("  {:<22} {}", key, value);
    }
}

/// Print a key-value pair colored by health
pub fn key_value_status(ctx: &UiContext, key: &str, value: &str, ok: bool) {
    if ctx.use_fancy_output() {
        let value_style = if ok {
            Style::new().green()
        } else {
            Style::new().yellow()
        };
        println!("  {:<22} {}", style(key).dim(), value_style.apply_to(value));
    } else {
        let tag = if ok { "" } else { " [WARN]" };
        println!("  {:<22} {}{}", key, value, tag);
    }
}
