//! Error types for principal reconciliation.
//!
//! Errors are categorized so the reconciler can decide how far a failure
//! reaches: the whole run, one login, or a single operation.

use crate::inspect::Probe;
use thiserror::Error;

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Input could not be validated; nothing may run
    Validation,
    /// Server unreachable or unsupported; nothing may run
    PreFlight,
    /// A read-only catalog check failed
    Inspection,
    /// A mutating statement failed
    Operation,
}

impl ErrorCategory {
    /// Whether this category aborts the run before any worker starts.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation | Self::PreFlight)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Validation => "Invalid specification",
            Self::PreFlight => "Pre-flight check failed",
            Self::Inspection => "Catalog check failed",
            Self::Operation => "Statement failed",
        }
    }
}

/// Errors that can occur while reconciling principals.
#[derive(Debug, Error)]
pub enum Error {
    /// Identifier rejected by the allow-list
    #[error("invalid {kind} name '{name}': {reason}")]
    InvalidIdentifier {
        /// What the identifier names (login, user, database, ...)
        kind: &'static str,
        /// The rejected value
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Explicit SID is not a 16-byte hex literal
    #[error("invalid sid '{sid}' for login '{login}': expected 0x followed by 32 hex digits")]
    InvalidSid {
        /// Login that declared the SID
        login: String,
        /// The rejected value
        sid: String,
    },

    /// The same login key appears twice and duplicates are rejected
    #[error("duplicate login '{login}' in {origin}")]
    DuplicateLogin {
        /// Login key that was repeated
        login: String,
        /// Source in which the second occurrence was found
        origin: String,
    },

    /// A source document does not match the input contract
    #[error("invalid specification in {origin}: {message}")]
    Specification {
        /// Source the document came from
        origin: String,
        /// Parser or validation message
        message: String,
    },

    /// Version string could not be parsed
    #[error("unrecognized sql server version '{0}'")]
    InvalidVersion(String),

    /// Major version outside the supported set
    #[error("sql server version {version} not supported")]
    UnsupportedVersion {
        /// Version reported by the server
        version: String,
    },

    /// Could not open a connection
    #[error("connection failed: {0}")]
    Connection(String),

    /// A statement or query failed on an open connection
    #[error("query failed: {0}")]
    Query(String),

    /// A read-only check failed
    #[error("{check} failed: {message}")]
    Inspection {
        /// The check that failed
        check: Probe,
        /// Underlying failure
        message: String,
    },

    /// A mutating operation failed
    #[error("{operation} failed: {message}")]
    Operation {
        /// Identity of the failed operation
        operation: String,
        /// Underlying failure
        message: String,
    },

    /// Worker pool could not be built
    #[error("worker pool: {0}")]
    Pool(String),
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidIdentifier { .. }
            | Error::InvalidSid { .. }
            | Error::DuplicateLogin { .. }
            | Error::Specification { .. } => ErrorCategory::Validation,
            Error::InvalidVersion(_)
            | Error::UnsupportedVersion { .. }
            | Error::Connection(_)
            | Error::Pool(_) => ErrorCategory::PreFlight,
            Error::Query(_) | Error::Inspection { .. } => ErrorCategory::Inspection,
            Error::Operation { .. } => ErrorCategory::Operation,
        }
    }

    /// Whether this error aborts the whole run.
    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }

    /// Wrap a failure of a read-only check with the check's identity.
    pub(crate) fn inspection(check: &Probe, source: Error) -> Self {
        Error::Inspection {
            check: check.clone(),
            message: source.to_string(),
        }
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, Error>;
