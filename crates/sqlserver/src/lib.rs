//! # sqlserver
//!
//! SQL Server backend for [`reconcile`].
//!
//! [`TdsFactory`] implements [`reconcile::ConnectionFactory`] over the TDS
//! protocol using `tiberius`. Every probe and operation gets its own
//! connection (no pooling) and every call is bounded by the configured
//! timeout. Mutations run inside a transaction that is committed on success
//! and rolled back on failure.
//!
//! ```ignore
//! use sqlserver::{ServerConfig, TdsFactory};
//! use reconcile::ConnectionFactory;
//!
//! let factory = TdsFactory::new(ServerConfig::new("db01"));
//! let version = factory.server_version()?;
//! ```

pub mod config;
pub mod error;
pub mod retry;
pub mod session;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use retry::{with_retry, RetryConfig};
pub use session::{TdsFactory, TdsSession};
