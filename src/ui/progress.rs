use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use condense_common::{
    CompactSession, CompactionResult, CompactionStep, LogLevel, Overview, SessionStatus,
};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::overview::OverviewProgress;
use crate::ui::icons::{CHECK, CROSS, LAYERS, OUTLINE, SAVE, SCALE, SCISSORS, SPARKLE, STOP, WARN};

fn step_icon(step: CompactionStep) -> String {
    match step {
        CompactionStep::Analyzing => SCALE.to_string(),
        CompactionStep::Chunking | CompactionStep::Mapping => SCISSORS.to_string(),
        CompactionStep::Reducing | CompactionStep::Hierarchical => LAYERS.to_string(),
        CompactionStep::Finalizing | CompactionStep::Saving => SAVE.to_string(),
        CompactionStep::Outlining => OUTLINE.to_string(),
        CompactionStep::Writing => SPARKLE.to_string(),
    }
}

/// One-line description of where a session is.
pub fn status_line(session: &CompactSession) -> String {
    let step = session
        .current_step
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| session.status.as_str().to_string());
    if session.chunks_total > 0 {
        format!(
            "{} ({}/{} chunks)",
            step, session.chunks_processed, session.chunks_total
        )
    } else {
        step
    }
}

/// `0.23` → `"23.0%"`.
pub fn format_ratio(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Terminal UI for one compaction run: a 0-100 bar plus the session's log
/// trail printed above it.
///
/// Warnings and errors from the log are always printed; info entries only in
/// verbose mode.
pub struct CompactionUI {
    multi: MultiProgress,
    bar: ProgressBar,
    verbose: bool,
    logs_seen: AtomicUsize,
}

impl CompactionUI {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let bar_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let bar = multi.add(ProgressBar::new(100));
        bar.set_style(bar_style);
        bar.set_prefix("Compacting");
        bar.enable_steady_tick(Duration::from_millis(120));

        Self {
            multi,
            bar,
            verbose,
            logs_seen: AtomicUsize::new(0),
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!`.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Render a session snapshot. Safe to call from the progress callback.
    pub fn update(&self, session: &CompactSession) {
        self.bar.set_position(u64::from(session.progress));
        let icon = session.current_step.map(step_icon).unwrap_or_default();
        self.bar
            .set_message(format!("{}{}", icon, style(status_line(session)).dim()));

        let seen = self.logs_seen.swap(session.logs.len(), Ordering::SeqCst);
        for entry in session.logs.iter().skip(seen) {
            match entry.level {
                LogLevel::Debug | LogLevel::Info if self.verbose => {
                    self.print_line(format!("    {} {}", style("→").dim(), style(&entry.message).dim()));
                }
                LogLevel::Debug | LogLevel::Info => {}
                LogLevel::Warn => {
                    self.print_line(format!("    {}{}", WARN, style(&entry.message).yellow()));
                }
                LogLevel::Error => {
                    self.print_line(format!("    {}{}", CROSS, style(&entry.message).red()));
                }
            }
        }
    }

    pub fn finish_success(&self, result: &CompactionResult) {
        self.bar.set_position(100);
        self.bar.finish_and_clear();
        println!(
            "{}Compacted {} → {} tokens ({}) using {}",
            CHECK,
            style(result.original_token_count).cyan(),
            style(result.compacted_token_count).cyan(),
            style(format_ratio(result.compression_ratio)).bold(),
            style(result.strategy_used).yellow()
        );
    }

    pub fn finish_failed(&self, message: &str) {
        self.bar.abandon();
        eprintln!("{}{}", CROSS, style(message).red());
    }

    pub fn finish_cancelled(&self) {
        self.bar.abandon();
        eprintln!("{}{}", STOP, style("Compaction cancelled").yellow());
    }
}

/// Terminal UI for overview generation: a spinner for the outline, then a
/// bar over section tasks.
pub struct OverviewUI {
    bar: ProgressBar,
}

impl OverviewUI {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:.bold.dim} {spinner} {msg}")
                .expect("progress bar template is a valid static string"),
        );
        bar.set_prefix("Overview");
        bar.set_message(format!("{}planning outline", OUTLINE));
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub fn update(&self, progress: &OverviewProgress) {
        match progress {
            OverviewProgress::OutlineReady { sections, attempt } => {
                self.bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                        .expect("progress bar template is a valid static string")
                        .progress_chars("█▓▒░"),
                );
                let note = if *attempt > 1 {
                    format!(" (outline attempt {})", attempt)
                } else {
                    String::new()
                };
                self.bar
                    .set_message(format!("writing {} sections{}", sections, note));
            }
            OverviewProgress::TaskFinished {
                section_id,
                ok,
                done,
                total,
            } => {
                self.bar.set_length(*total as u64);
                self.bar.set_position(*done as u64);
                if !ok {
                    self.bar.println(format!(
                        "    {}{}",
                        WARN,
                        style(format!("task for '{}' failed", section_id)).yellow()
                    ));
                }
            }
        }
    }

    pub fn finish(&self, overview: &Overview) {
        self.bar.finish_and_clear();
        println!(
            "{}{}: {} sections, ~{} tokens",
            SPARKLE,
            style(&overview.title).bold(),
            overview.sections.len(),
            overview.total_tokens()
        );
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

impl Default for OverviewUI {
    fn default() -> Self {
        Self::new()
    }
}

/// Colored status label for listings.
pub fn styled_status(status: SessionStatus) -> String {
    match status {
        SessionStatus::Pending => style(status.as_str()).dim().to_string(),
        SessionStatus::Processing => style(status.as_str()).cyan().to_string(),
        SessionStatus::Completed => style(status.as_str()).green().to_string(),
        SessionStatus::Failed => style(status.as_str()).red().to_string(),
        SessionStatus::Cancelled => style(status.as_str()).yellow().to_string(),
    }
}
