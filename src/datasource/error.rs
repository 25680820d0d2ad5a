//! Error types for the storage layer
//!
//! All database-engine failures surface as a single [`DbError::Sqlite`]
//! variant. A failure while releasing a resource never masks the failure of
//! the operation that was in flight; see [`with_close`].

use thiserror::Error;
use tracing::warn;

/// Errors produced by the storage layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// A failure reported by the embedded database engine (connectivity,
    /// syntax, constraint violations).
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection handle is gone while the store is not in its closing
    /// state. This only happens after a failed reconnect during
    /// defragmentation and indicates the store can no longer serve requests.
    #[error("database connection is no longer available")]
    ConnectionClosed,
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, DbError>;

/// Composes an operation result with the result of releasing a resource
/// afterwards.
///
/// The operation's failure always takes precedence: if both failed, the
/// release failure is logged and discarded. If only the release failed, its
/// error is returned so it is never silently swallowed.
pub(crate) fn with_close<T>(result: Result<T>, close_result: Result<()>) -> Result<T> {
    match (result, close_result) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!("suppressing close error in favor of original error: {close_err}");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_error() -> DbError {
        DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows)
    }

    #[test]
    fn test_with_close_both_ok() {
        let result = with_close(Ok(7), Ok(()));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_with_close_release_failure_surfaces() {
        let result = with_close(Ok(7), Err(engine_error()));
        assert!(result.is_err());
    }

    #[test]
    fn test_with_close_original_error_wins() {
        let result: Result<i64> = with_close(Err(DbError::ConnectionClosed), Err(engine_error()));
        assert!(matches!(result, Err(DbError::ConnectionClosed)));
    }
}
