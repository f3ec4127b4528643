// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Terminal color utilities
//!
//! Provides consistent color schemes across the CLI.

use colored::{ColoredString, Colorize};
use console::Term;

use crate::pipeline::{RunVerdict, StageState};

/// Check if colors should be used on stdout
pub fn should_use_colors() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }

    Term::stdout().is_term()
}

/// Symbol shown next to a stage in run output
pub fn stage_symbol(state: StageState) -> ColoredString {
    match state {
        StageState::Passed => "✓".green(),
        StageState::FailedAdvisory => "⚠".yellow(),
        StageState::FailedFatal => "✗".red(),
        StageState::Skipped => "○".dimmed(),
        StageState::Cancelled => "⊘".yellow(),
        StageState::Running | StageState::Retrying => "→".blue(),
        StageState::Pending | StageState::Ready | StageState::Queued => "·".dimmed(),
    }
}

/// Verdict styled by outcome
pub fn verdict(verdict: RunVerdict) -> ColoredString {
    let text = format!("Pipeline {}", verdict);
    match verdict {
        RunVerdict::Succeeded => text.green().bold(),
        RunVerdict::PartiallySucceededWithAdvisories => text.yellow().bold(),
        RunVerdict::Failed => text.red().bold(),
        RunVerdict::Cancelled => text.yellow().bold(),
    }
}

/// Print a styled header
pub fn print_header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "═".repeat(title.len().max(40)));
}

/// Print a styled section
pub fn print_section(title: &str) {
    println!();
    println!("{}:", title.bold());
}

/// Print a warning
pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠".yellow(), msg);
}

/// Print an info item
pub fn print_info(msg: &str) {
    println!("  {} {}", "→".blue(), msg);
}
