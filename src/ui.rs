use anyhow::Result;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reconcile::{LoginReport, ProgressCallback, RunReport, RunSummary};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Ask before mutating anything.
pub fn confirm(prompt: &str) -> Result<bool> {
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmed)
}

// ============================================================================
// Report rendering
// ============================================================================

/// Outcome symbol for one login.
pub fn login_symbol(report: &LoginReport) -> &'static str {
    if !report.success || report.has_errors() {
        "✗"
    } else if report.changed {
        "~"
    } else if report.warnings.is_empty() {
        "○"
    } else {
        "⚠"
    }
}

/// Print every login that changed, warned or failed. Untouched logins are
/// only listed with `verbose`.
pub fn print_report(report: &RunReport, verbose: bool) {
    let title = if report.check_mode {
        "Planned changes"
    } else {
        "Applied changes"
    };
    header(title);
    kv("sql server", &report.sql_server_version);
    kv(
        "started",
        &report
            .started_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    );

    for (login, result) in &report.changes {
        let quiet_login = !result.changed && result.warnings.is_empty() && result.errors.is_empty();
        if quiet_login && !verbose {
            continue;
        }

        let symbol = login_symbol(result);
        let symbol = match symbol {
            "✗" => symbol.red(),
            "~" => symbol.yellow(),
            "⚠" => symbol.yellow(),
            _ => symbol.dimmed(),
        };
        println!();
        println!("  {} {}", symbol, login.bold());
        for change in &result.changes {
            println!("      {} {}", "+".green(), change);
        }
        for warning in &result.warnings {
            println!("      {} {}", "⚠".yellow(), warning.yellow());
        }
        for error in &result.errors {
            println!("      {} {}", "✗".red(), error.red());
        }
    }
}

/// Print final summary
pub fn print_summary(summary: &RunSummary, check_mode: bool, elapsed: f64) {
    println!();
    if summary.failed_logins == 0 && summary.errors == 0 {
        let verb = if check_mode { "Plan complete" } else { "Applied successfully" };
        println!("  {} {} in {:.2}s", "✓".green().bold(), verb, elapsed);
    } else {
        println!(
            "  {} Finished with errors in {:.2}s",
            "⚠".yellow().bold(),
            elapsed
        );
    }

    println!("    • {} logins checked", summary.logins);
    if summary.changed_logins > 0 {
        let verb = if check_mode { "would change" } else { "changed" };
        println!(
            "    • {} logins {} ({} changes)",
            summary.changed_logins, verb, summary.changes
        );
    }
    if summary.warnings > 0 {
        println!("    • {} {}", summary.warnings, "warnings".yellow());
    }
    if summary.failed_logins > 0 || summary.errors > 0 {
        println!(
            "    • {} {} ({} logins failed)",
            summary.errors,
            "errors".red(),
            summary.failed_logins
        );
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Progress bar fed by the reconciler's worker threads.
pub struct LoginProgress {
    bar: ProgressBar,
}

impl LoginProgress {
    pub fn new(label: &str, hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {prefix} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_prefix(label.to_string());
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressCallback for LoginProgress {
    fn on_run_start(&self, logins: usize) {
        self.bar.set_length(logins as u64);
    }

    fn on_login_complete(&self, login: &str, report: &LoginReport) {
        self.bar
            .set_message(format!("{} {}", login_symbol(report), login));
        self.bar.inc(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
