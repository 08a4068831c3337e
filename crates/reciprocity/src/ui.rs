//! Terminal rendering for the interactive front end.

use std::collections::HashMap;

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::classify::Classification;
use crate::events::RunEvent;
use crate::source::Collection;
use crate::store::{ResultSetInfo, SessionInfo};

/// Print the start banner.
pub fn print_banner() {
    println!();
    println!("{}", "Reciprocity - follow-back audit".cyan().bold());
    println!("{}", "═".repeat(40).bright_black());
    println!();
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Renders run events: log lines are printed, progress goes to one bar per label.
pub struct TerminalObserver {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl Default for TerminalObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalObserver {
    /// Create an observer with no bars.
    #[must_use]
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Print a line above the bars.
    pub fn println(&self, line: &str) {
        self.multi.suspend(|| println!("{line}"));
    }

    /// Render one event.
    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Log { text } => {
                let line = if text.starts_with("[ERROR]") {
                    text.red().to_string()
                } else if text.starts_with("[WARN]") || text.starts_with("[RATE-LIMIT]") {
                    text.yellow().to_string()
                } else if text.starts_with("[SKIP]") {
                    text.bright_black().to_string()
                } else {
                    text.clone()
                };
                self.println(&line);
            }
            RunEvent::Progress {
                label,
                current,
                total,
            } => {
                let bar = self
                    .bars
                    .entry(label.clone())
                    .or_insert_with(|| self.multi.add(new_bar(label, *total)));
                if let Some(total) = total {
                    bar.set_length((*total).max(*current));
                }
                bar.set_position(*current);
            }
            RunEvent::Done { .. } | RunEvent::Failed { .. } => self.finish(),
            RunEvent::RequestSecondFactor | RunEvent::LockInput | RunEvent::UnlockInput => {}
        }
    }

    /// Stop all bars, leaving their last state on screen.
    pub fn finish(&mut self) {
        for bar in self.bars.values() {
            bar.finish();
        }
    }
}

fn new_bar(label: &str, total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) => {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg:>10}: {pos}/{len} [{bar:30.cyan/blue}] {percent}%",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓_"),
            );
            bar.set_message(label.to_string());
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner:.green} {msg}: {pos} items")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_message(label.to_string());
            bar
        }
    }
}

/// Print the two derived lists of a classification.
pub fn print_classification(classification: &Classification, profile_url_base: &str) {
    println!();
    println!(
        "{} following, {} followers",
        classification.following.len().to_string().bold(),
        classification.followers.len().to_string().bold()
    );
    print_list(
        "Not following you back",
        &classification.following_only,
        profile_url_base,
    );
    print_list(
        "Fans you don't follow back",
        &classification.fans_only,
        profile_url_base,
    );
}

fn print_list(title: &str, collection: &Collection, profile_url_base: &str) {
    println!();
    println!(
        "{} ({})",
        title.cyan().bold(),
        collection.len().to_string().bold()
    );
    if collection.is_empty() {
        println!("  {}", "none".bright_black());
        return;
    }
    for entity in &collection.entities {
        let link = format!("{profile_url_base}{}", entity.id);
        if entity.display_name.is_empty() {
            println!("  {} {}", entity.id, link.bright_black());
        } else {
            println!(
                "  {} ({}) {}",
                entity.id,
                entity.display_name,
                link.bright_black()
            );
        }
    }
}

/// Menu label for a result set.
#[must_use]
pub fn result_label(info: &ResultSetInfo) -> String {
    match info.reference.created_at() {
        Some(at) => format!(
            "{} ({})",
            info.reference.handle,
            at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => info.folder.clone(),
    }
}

/// Menu label for a stored session.
#[must_use]
pub fn session_label(info: &SessionInfo) -> String {
    format!(
        "{} (last used {})",
        info.handle,
        info.last_used
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M")
    )
}
