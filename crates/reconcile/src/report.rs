//! Per-login and batch results

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of reconciling one login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginReport {
    pub changed: bool,
    pub changes: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// False when the login could not be reconciled at all
    pub success: bool,
}

impl Default for LoginReport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoginReport {
    pub fn new() -> Self {
        Self {
            changed: false,
            changes: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            success: true,
        }
    }

    /// A report for a login whose worker died.
    pub fn failed(error: impl Into<String>) -> Self {
        let mut report = Self::new();
        report.fail(error);
        report
    }

    pub fn record_change(&mut self, change: impl Into<String>) {
        self.changed = true;
        self.changes.push(change.into());
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Record a recoverable error.
    pub fn error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Record an error that ends this login's run.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.success = false;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub sql_server_version: String,
    pub started_at: DateTime<Utc>,
    /// Seconds
    pub execution_time: f64,
    pub sql_logins_count: usize,
    pub check_mode: bool,
    pub changed: bool,
    pub changes: BTreeMap<String, LoginReport>,
    /// Logins with warnings only
    pub warnings: BTreeMap<String, Vec<String>>,
    /// Logins with errors only
    pub errors: BTreeMap<String, Vec<String>>,
}

impl RunReport {
    pub fn new(sql_server_version: impl Into<String>, check_mode: bool) -> Self {
        Self {
            sql_server_version: sql_server_version.into(),
            started_at: Utc::now(),
            execution_time: 0.0,
            sql_logins_count: 0,
            check_mode,
            changed: false,
            changes: BTreeMap::new(),
            warnings: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    /// Merge one login's outcome.
    pub fn aggregate(&mut self, login: &str, report: LoginReport) {
        self.changed |= report.changed;
        self.sql_logins_count += 1;
        if !report.warnings.is_empty() {
            self.warnings
                .insert(login.to_string(), report.warnings.clone());
        }
        if !report.errors.is_empty() {
            self.errors.insert(login.to_string(), report.errors.clone());
        }
        self.changes.insert(login.to_string(), report);
    }

    /// Every login succeeded without recorded errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.changes.values().all(|r| r.success)
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for report in self.changes.values() {
            summary.logins += 1;
            if report.changed {
                summary.changed_logins += 1;
            }
            if !report.success {
                summary.failed_logins += 1;
            }
            summary.changes += report.changes.len();
            summary.warnings += report.warnings.len();
            summary.errors += report.errors.len();
        }
        summary
    }
}

/// Counts over a run report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub logins: usize,
    pub changed_logins: usize,
    pub failed_logins: usize,
    pub changes: usize,
    pub warnings: usize,
    pub errors: usize,
}
