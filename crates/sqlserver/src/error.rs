//! Error types for the TDS backend.

use thiserror::Error;

/// Errors raised while talking to SQL Server.
#[derive(Debug, Error)]
pub enum Error {
    /// TCP connect or socket failure
    #[error("network error connecting to {address}: {message}")]
    Network {
        /// host:port that was dialed
        address: String,
        message: String,
    },

    /// Login handshake or server-side error
    #[error("sql server error: {0}")]
    Server(#[from] tiberius::error::Error),

    /// A call did not finish in time
    #[error("timed out after {0}s")]
    Timeout(u64),

    /// The async runtime could not be created
    #[error("failed to create runtime: {0}")]
    Runtime(String),

    /// The server answered with an unexpected shape
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
}

impl Error {
    /// Whether a new connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } | Error::Timeout(_) => true,
            Error::Server(e) => matches!(e, tiberius::error::Error::Io { .. }),
            _ => false,
        }
    }

    pub(crate) fn network(address: &str, source: &std::io::Error) -> Self {
        Error::Network {
            address: address.to_string(),
            message: source.to_string(),
        }
    }
}

impl From<Error> for reconcile::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Network { .. } | Error::Timeout(_) | Error::Runtime(_) => {
                reconcile::Error::Connection(e.to_string())
            }
            Error::Server(_) | Error::UnexpectedResult(_) => reconcile::Error::Query(e.to_string()),
        }
    }
}

/// Result type for backend calls.
pub type Result<T> = std::result::Result<T, Error>;
