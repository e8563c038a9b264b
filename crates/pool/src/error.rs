//! Error types for pool operations
use thiserror::Error;

use crate::handle::HandleId;

/// Boxed error produced by a [`ConnectionFactory`](crate::ConnectionFactory).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the pool.
///
/// Problems discovered by housekeeping (failed validation, failed close) are
/// never returned here; they go to listeners, events and logs instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Pool configuration or a runtime setting is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// No connection became available before the deadline
    #[error(
        "Timed out after {waited_ms}ms acquiring a connection from '{pool}': \
         {active}/{max_size} in use, {waiters} waiting"
    )]
    AcquireTimeout {
        /// The pool name
        pool: String,
        /// How long the caller waited, in milliseconds
        waited_ms: u64,
        /// Connections checked out when the deadline passed
        active: usize,
        /// Configured maximum pool size
        max_size: usize,
        /// Other callers blocked in the handoff pool
        waiters: usize,
    },

    /// The factory failed to open a connection requested by this caller
    #[error("Failed to create a connection for '{pool}': {source}")]
    Creation {
        /// The pool name
        pool: String,
        /// The underlying factory error
        #[source]
        source: BoxError,
    },

    /// The pool has been closed
    #[error("Pool '{pool}' is closed")]
    Closed {
        /// The pool name
        pool: String,
    },

    /// A transaction-enlisted connection is already borrowed by another guard
    #[error("Connection {handle} of pool '{pool}' is already in use by its unit of work")]
    HandleBusy {
        /// The pool name
        pool: String,
        /// The enlisted handle
        handle: HandleId,
    },

    /// The housekeeping runtime could not be started
    #[error("Failed to start housekeeping for '{pool}': {source}")]
    Scheduler {
        /// The pool name
        pool: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AcquireTimeout { .. } | Self::Creation { .. } | Self::HandleBusy { .. } => true,
            Self::Configuration { .. } | Self::Closed { .. } | Self::Scheduler { .. } => false,
        }
    }

    /// Whether this error reports an expired acquisition deadline
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AcquireTimeout { .. })
    }

    /// Get the pool name associated with this error (if any)
    #[must_use]
    pub fn pool_name(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => None,
            Self::AcquireTimeout { pool, .. }
            | Self::Creation { pool, .. }
            | Self::Closed { pool }
            | Self::HandleBusy { pool, .. }
            | Self::Scheduler { pool, .. } => Some(pool),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable() {
        let err = Error::AcquireTimeout {
            pool: "db".to_string(),
            waited_ms: 1000,
            active: 10,
            max_size: 10,
            waiters: 2,
        };
        assert!(err.is_retryable());
        assert!(err.is_timeout());
        assert_eq!(err.pool_name(), Some("db"));
        assert!(err.to_string().contains("10/10 in use"));
    }

    #[test]
    fn closed_is_not_retryable() {
        let err = Error::Closed {
            pool: "db".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_timeout());
    }

    #[test]
    fn creation_error_exposes_source() {
        let err = Error::Creation {
            pool: "db".to_string(),
            source: "connection refused".into(),
        };
        let source = std::error::Error::source(&err).expect("source should be set");
        assert_eq!(source.to_string(), "connection refused");
    }

    #[test]
    fn configuration_has_no_pool() {
        let err = Error::configuration("max_size must be greater than 0");
        assert_eq!(err.pool_name(), None);
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
