//! Connection and progress provider traits
//!
//! These traits keep the engine independent of a specific driver or UI.
//! The caller injects a [`ConnectionFactory`]; every probe and operation
//! opens its own [`Session`] from it and drops the session when done.

use crate::error::Result;
use crate::inspect::Probe;
use crate::operation::Operation;
use crate::report::LoginReport;
use crate::sql::ServerVersion;

/// Source of scoped server sessions
///
/// Implementations must be shareable across worker threads. Sessions
/// themselves are used by one thread at a time and never shared.
pub trait ConnectionFactory: Send + Sync {
    /// Open a session whose default database is `database`.
    fn connect(&self, database: &str) -> Result<Box<dyn Session + '_>>;

    /// Raw `SERVERPROPERTY('ProductVersion')`.
    fn server_version(&self) -> Result<String>;
}

/// One open connection, scoped to a database.
pub trait Session {
    /// Answer a yes/no probe. `None` when the catalog has no row or a NULL.
    fn flag(&mut self, probe: &Probe) -> Result<Option<bool>>;

    /// Answer a probe that lists names.
    fn names(&mut self, probe: &Probe) -> Result<Vec<String>>;

    /// Run a mutating operation inside its own transaction.
    fn apply(&mut self, operation: &Operation, version: &ServerVersion) -> Result<()>;
}

/// Progress callback for reconciliation runs
///
/// Called from worker threads, hence `Sync` and `&self`.
pub trait ProgressCallback: Sync {
    /// Called once before workers start
    fn on_run_start(&self, _logins: usize) {}

    /// Called when a login's plan has been executed
    fn on_login_complete(&self, login: &str, report: &LoginReport);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_login_complete(&self, _login: &str, _report: &LoginReport) {}
}
