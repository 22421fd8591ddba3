//! # Reconcile
//!
//! Declarative reconciliation of SQL Server security principals.
//!
//! Declare logins, their database users and role memberships; this crate
//! reads the live catalog, computes the minimal idempotent set of changes
//! and applies them (or only reports them in check mode), many logins at a
//! time.
//!
//! ## Core Concepts
//!
//! - **Specification**: validated, merged [`LoginSpec`]s built from JSON documents
//! - **Inspector**: read-only [`Probe`]s answering what the server holds now
//! - **Plan**: a pure mapping from desired plus observed state to [`Operation`]s
//! - **Executor**: re-checks each operation's precondition, then applies it or not
//! - **Reconciler**: pre-flight, bulk existence check, worker pool, [`RunReport`]
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{MemoryServer, Reconciler, RunOptions, Specification};
//!
//! let server = MemoryServer::new("15.0.2000.5");
//! let mut spec = Specification::default();
//! spec.add_json("logins.json", r#"{"alice": {"password": "pw"}}"#)?;
//!
//! let report = Reconciler::new(&server, RunOptions::check()).run(&spec, "15.0.2000.5")?;
//! assert!(report.changed);
//! ```
//!
//! ## Provider Traits
//!
//! - [`ConnectionFactory`] / [`Session`]: scoped server sessions, injected by the caller
//! - [`ProgressCallback`]: receives each finished login
//!
//! The crate has no driver dependency; `sqlserver` provides the TDS backend.
//! The `testing` feature adds `MemoryServer`, an in-memory catalog for tests.

pub mod context;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod inspect;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod model;
pub mod operation;
pub mod plan;
pub mod reconciler;
pub mod report;
pub mod sql;
pub mod types;

// Re-export main types at crate root
pub use context::{ConnectionFactory, NoProgress, ProgressCallback, Session};
pub use coordinator::WorkerPool;
pub use error::{Error, ErrorCategory, Result};
pub use executor::Executor;
pub use inspect::{Inspector, Probe};
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryServer;
pub use model::{
    derive_sid, is_windows_login, DatabaseBinding, DuplicatePolicy, Entries, LoginDocument,
    LoginSpec, Password, PrincipalState, RoleSet, Specification, UserSpec,
};
pub use operation::Operation;
pub use plan::{plan_login, Plan};
pub use reconciler::Reconciler;
pub use report::{LoginReport, RunReport, RunSummary};
pub use sql::{Param, ServerVersion, Statement};
pub use types::{
    BindingStatus, Mode, ObservedBinding, ObservedLoginState, ObservedUserState, RunOptions,
    SkipReason,
};
