//! Error types for Ratekeeper.

use std::time::Duration;

use thiserror::Error;

/// Rejected rate-limit arguments.
///
/// These are raised before any backend is engaged, so no quota has been
/// consumed when one is returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cost must be greater than 0")]
    Cost,
    #[error("rate must be greater than 0")]
    Rate,
    #[error("window must be greater than 0")]
    Window,
    #[error("key must not be empty")]
    Key,
}

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Invalid cost, rate, window or key
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The remote procedure could not be executed
    #[error("failed to invoke {procedure} procedure: {source}")]
    Transport {
        procedure: &'static str,
        #[source]
        source: redis::RedisError,
    },

    /// The remote procedure answered with something we cannot interpret
    #[error("unexpected reply from {procedure} procedure: {detail}")]
    Protocol {
        procedure: &'static str,
        detail: String,
    },

    /// The local compare-and-swap loop gave up
    #[error("gave up on key {key} after {attempts} compare-and-swap attempts")]
    Contention { key: String, attempts: u32 },

    /// The call did not finish within the configured deadline
    #[error("rate limit call cancelled after {elapsed:?}")]
    Cancelled { elapsed: Duration },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatekeeperError {
    pub(crate) fn transport(procedure: &'static str, source: redis::RedisError) -> Self {
        RatekeeperError::Transport { procedure, source }
    }

    pub(crate) fn protocol(procedure: &'static str, detail: impl Into<String>) -> Self {
        RatekeeperError::Protocol {
            procedure,
            detail: detail.into(),
        }
    }

    /// Whether repeating the same call might succeed.
    ///
    /// Connection-level failures and cancellations are transient. A reply
    /// error from the server (WRONGTYPE, a failing script, bad arguments)
    /// repeats on every attempt, as do validation and protocol errors.
    /// Contention is reported so the caller can back off rather than spin.
    pub fn is_retryable(&self) -> bool {
        match self {
            RatekeeperError::Transport { source, .. } => is_transient(source),
            RatekeeperError::Cancelled { .. } | RatekeeperError::Contention { .. } => true,
            _ => false,
        }
    }
}

fn is_transient(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            redis::ErrorKind::IoError | redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
        )
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
