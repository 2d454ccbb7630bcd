pub mod apply;
pub mod completions;
pub mod diff;
pub mod lock;
pub mod projects;
pub mod register;
pub mod verify;

use envlock_core::{DriftCategory, DriftReport};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
/// Largest exit code used to report a drift count.
pub const EXIT_MAX_DRIFT: u8 = 100;
pub const EXIT_FAILURE: u8 = 101;
pub const EXIT_PARSE_ERROR: u8 = 102;
pub const EXIT_RUNTIME_UNAVAILABLE: u8 = 103;
pub const EXIT_VALIDATION_ERROR: u8 = 104;
pub const EXIT_PARTIAL_FAILURE: u8 = 105;
pub const EXIT_TIMEOUT: u8 = 124;
pub const EXIT_CANCELLED: u8 = 130;

/// Exit code for a verify that found `count` differences.
pub fn drift_exit_code(count: usize) -> u8 {
    if count == 0 {
        return EXIT_SUCCESS;
    }
    count.min(usize::from(EXIT_MAX_DRIFT)) as u8
}

/// Map an error message back to its exit code by the error's prefix.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("parse error:") {
        EXIT_PARSE_ERROR
    } else if msg.starts_with("runtime unavailable:") {
        EXIT_RUNTIME_UNAVAILABLE
    } else if msg.starts_with("validation error:") {
        EXIT_VALIDATION_ERROR
    } else if msg.starts_with("apply failed during") {
        EXIT_PARTIAL_FAILURE
    } else if msg.starts_with("operation timed out") {
        EXIT_TIMEOUT
    } else if msg.starts_with("operation cancelled") {
        EXIT_CANCELLED
    } else {
        EXIT_FAILURE
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Spinner for human output only; JSON output stays clean.
pub fn maybe_spinner(json: bool, msg: &str) -> Option<ProgressBar> {
    (!json).then(|| spinner(msg))
}

pub fn colorize_category(category: DriftCategory) -> String {
    use console::Style;
    let name = category.as_str();
    match category {
        DriftCategory::BaseImage | DriftCategory::Container => {
            Style::new().red().bold().apply_to(name).to_string()
        }
        DriftCategory::Registry | DriftCategory::AptSource => {
            Style::new().magenta().apply_to(name).to_string()
        }
        _ => Style::new().yellow().apply_to(name).to_string(),
    }
}

pub fn print_report(report: &DriftReport) {
    for item in report.items() {
        println!("[{}] {}", colorize_category(item.category), item.description);
        for detail in &item.details {
            println!("    {detail}");
        }
    }
}
