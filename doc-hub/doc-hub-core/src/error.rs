//! Error taxonomy shared by the store, the change feed and the transport.

use crate::db::DbError;
use crate::filter::FilterError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Authorization failed. The message never says whether the target exists.
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("encryption failure: {0}")]
    Encryption(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Database(DbError),
}

impl StoreError {
    /// Stable identifier used in error replies on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::AccessDenied(_) => "access_denied",
            StoreError::NotFound(_) => "not_found",
            StoreError::Validation(_) => "validation",
            StoreError::Concurrency(_) => "concurrency",
            StoreError::CapacityExceeded(_) => "capacity_exceeded",
            StoreError::Encryption(_) => "encryption",
            StoreError::Transport(_) => "transport",
            StoreError::Database(_) => "database",
        }
    }

    pub(crate) fn denied(what: impl Into<String>) -> Self {
        StoreError::AccessDenied(what.into())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        StoreError::Validation(what.into())
    }
}

/// Key collisions and bad queries are the caller's fault.
impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::DuplicateKey { .. } => StoreError::Validation(err.to_string()),
            DbError::InvalidQuery(e) => StoreError::Validation(e.to_string()),
            other => StoreError::Database(other),
        }
    }
}

impl From<FilterError> for StoreError {
    fn from(err: FilterError) -> Self {
        StoreError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("more than {limit} fragments buffered for message {id}")]
    BufferOverflow { id: String, limit: usize },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("outbound queue full")]
    QueueFull,
    #[error("request rejected: {0}")]
    Rejected(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(StoreError::denied("x").kind(), "access_denied");
        assert_eq!(StoreError::invalid("x").kind(), "validation");
        let e: StoreError = TransportError::ConnectionClosed.into();
        assert_eq!(e.kind(), "transport");
        assert_eq!(e.to_string(), "connection closed");
    }

    #[test]
    fn duplicate_keys_are_validation_errors() {
        let dup = DbError::DuplicateKey { collection: "users".into(), key: "_id".into() };
        assert_eq!(StoreError::from(dup).kind(), "validation");
        assert_eq!(StoreError::from(DbError::Backend("io".into())).kind(), "database");
    }
}
