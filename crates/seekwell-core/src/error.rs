//! Error taxonomy shared by every backend and engine.
//!
//! Adapters translate backend-specific failures (sqlx, reqwest) into
//! [`StoreError`] at the contract boundary, so callers branch on the
//! error kind rather than on backend identity.

use thiserror::Error;

/// Errors surfaced by the database contract and the retrieval engines.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity failure: unreachable server, pool checkout timeout,
    /// broken socket. Transient; a retry may succeed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid or incomplete configuration. Raised at construction time,
    /// never lazily on first use.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backend declines an operation it does not implement.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// Commit or rollback outside an active transaction, or a begin
    /// while one is already open.
    #[error("transaction state error: {0}")]
    TransactionState(String),

    /// The external vector-index service failed after all call shapes
    /// were attempted.
    #[error("external index error: {0}")]
    ExternalIndex(String),

    /// SQL-level failure that is neither transient nor configuration:
    /// syntax errors, constraint violations, unknown tables.
    #[error("query error: {0}")]
    Query(String),
}

impl StoreError {
    pub fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        StoreError::Unsupported { backend, operation }
    }

    /// Whether a retry of the failed operation may succeed. The crate
    /// never retries on its own; retry policy belongs to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_transient() {
        assert!(StoreError::Connection("timed out".into()).is_transient());
        assert!(!StoreError::Configuration("missing host".into()).is_transient());
        assert!(!StoreError::Query("no such table".into()).is_transient());
    }

    #[test]
    fn unsupported_names_backend_and_operation() {
        let err = StoreError::unsupported("embedded", "store_vector");
        let msg = err.to_string();
        assert!(msg.contains("embedded"));
        assert!(msg.contains("store_vector"));
    }
}
