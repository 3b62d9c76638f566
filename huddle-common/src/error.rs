//! Common error types for huddle

use thiserror::Error;

/// Common result type for huddle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across huddle nodes
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Domain rule rejected the operation; nothing was written
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation lost a race or is not valid in the current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Shared state store unreachable after the retry budget
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Bounded operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    ///
    /// Lock contention and timeouts are transient; validation and
    /// conflicts are deterministic and must not be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "sqlx")]
            Error::Database(e) => is_transient_sqlx(e),
            Error::Io(_) | Error::StoreUnavailable(_) | Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the failed write is known not to have been applied.
    ///
    /// A timeout or an I/O error may fire after the backend committed, so
    /// only lock contention and refusals to start qualify. Writes that are
    /// not idempotent retry only on these.
    pub fn proves_no_write(&self) -> bool {
        match self {
            #[cfg(feature = "sqlx")]
            Error::Database(e) => {
                matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed)
                    || is_lock_contention(e)
            }
            Error::StoreUnavailable(_) => true,
            _ => false,
        }
    }
}

#[cfg(feature = "sqlx")]
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        _ => is_lock_contention(err),
    }
}

#[cfg(feature = "sqlx")]
fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
            let code = db.code();
            let primary = code
                .as_deref()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| c & 0xff);
            matches!(primary, Some(5) | Some(6))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout("get".into()).is_transient());
        assert!(Error::StoreUnavailable("down".into()).is_transient());
        assert!(!Error::Conflict("lost race".into()).is_transient());
        assert!(!Error::Validation("empty rationale".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_timeouts_do_not_prove_no_write() {
        assert!(!Error::Timeout("append".into()).proves_no_write());
        assert!(!Error::Io(std::io::Error::other("reset")).proves_no_write());
        assert!(Error::StoreUnavailable("locked".into()).proves_no_write());
        assert!(!Error::Conflict("taken".into()).proves_no_write());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::Conflict("inconsistency already resolved".into());
        assert_eq!(err.to_string(), "Conflict: inconsistency already resolved");
    }
}
