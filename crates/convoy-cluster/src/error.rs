//! Coordination error types

use thiserror::Error;
use uuid::Uuid;

/// Result type for coordination operations
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Coordination errors
#[derive(Debug, Error)]
pub enum ConvoyError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Store Errors ====================
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== Resource Errors ====================
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict on resource {id}: {reason}")]
    Conflict { id: Uuid, reason: String },

    #[error("consumer name mismatch for resource {id}: stored {stored}, reported {reported}")]
    ConsumerMismatch {
        id: Uuid,
        stored: String,
        reported: String,
    },

    // ==================== Lock Errors ====================
    #[error("failed to acquire {class} lock for {key}: {reason}")]
    LockAcquisition {
        key: String,
        class: &'static str,
        reason: String,
    },

    #[error("consumer {0} is not subscribed on this instance")]
    ConsumerNotSubscribed(String),

    #[error("unsupported lock class {0} for event routing")]
    UnsupportedLockClass(&'static str),

    // ==================== Notification Errors ====================
    #[error("notification channel {channel} disconnected: {reason}")]
    ChannelDisconnected { channel: String, reason: String },

    // ==================== Broker Errors ====================
    #[error("broker error: {0}")]
    Broker(String),

    #[error("unsupported resource action: {0}")]
    UnsupportedAction(String),

    // ==================== Broadcast Errors ====================
    #[error("subscriber {client} disconnected: {reason}")]
    SubscriberDisconnected { client: Uuid, reason: String },

    // ==================== Handler Errors ====================
    #[error("handler failed for {kind} event {event_id}: {reason}")]
    Handler {
        kind: String,
        event_id: Uuid,
        reason: String,
    },

    // ==================== Internal Errors ====================
    #[error("internal error: {0}")]
    Internal(String),

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ConvoyError {
    /// Build a not-found error for the given entity kind
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ConvoyError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Check if this error is retriable
    ///
    /// Transient infrastructure failures re-enter the same wait/poll loop;
    /// data and protocol errors do not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ConvoyError::Database(_)
                | ConvoyError::Pool(_)
                | ConvoyError::LockAcquisition { .. }
                | ConvoyError::ChannelDisconnected { .. }
                | ConvoyError::Broker(_)
        )
    }

    /// Check if this error means the referenced row no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConvoyError::NotFound { .. })
    }

    /// Stable short label, used for metrics
    pub fn category(&self) -> &'static str {
        match self {
            ConvoyError::InvalidConfig(_) => "config",
            ConvoyError::Database(_) | ConvoyError::Pool(_) | ConvoyError::Storage(_) => "store",
            ConvoyError::Serialization(_) => "serialization",
            ConvoyError::NotFound { .. } => "not_found",
            ConvoyError::Conflict { .. } => "conflict",
            ConvoyError::ConsumerMismatch { .. } | ConvoyError::UnsupportedAction(_) => "protocol",
            ConvoyError::LockAcquisition { .. }
            | ConvoyError::ConsumerNotSubscribed(_)
            | ConvoyError::UnsupportedLockClass(_) => "lock",
            ConvoyError::ChannelDisconnected { .. } => "notify",
            ConvoyError::Broker(_) => "broker",
            ConvoyError::SubscriberDisconnected { .. } => "broadcast",
            ConvoyError::Handler { .. } => "handler",
            ConvoyError::Internal(_) | ConvoyError::ShuttingDown => "internal",
        }
    }
}

impl From<deadpool_postgres::PoolError> for ConvoyError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        ConvoyError::Pool(e.to_string())
    }
}

impl From<deadpool_postgres::CreatePoolError> for ConvoyError {
    fn from(e: deadpool_postgres::CreatePoolError) -> Self {
        ConvoyError::InvalidConfig(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ConvoyError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ConvoyError::ShuttingDown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(ConvoyError::Pool("timed out".into()).is_retriable());
        assert!(ConvoyError::LockAcquisition {
            key: "e1".into(),
            class: "events",
            reason: "connection reset".into(),
        }
        .is_retriable());
        assert!(!ConvoyError::not_found("resource", "r1").is_retriable());
        assert!(!ConvoyError::UnsupportedAction("resync".into()).is_retriable());
    }

    #[test]
    fn test_not_found() {
        let err = ConvoyError::not_found("event", Uuid::nil());
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "event not found: 00000000-0000-0000-0000-000000000000"
        );
        assert!(!ConvoyError::ShuttingDown.is_not_found());
    }

    #[test]
    fn test_categories() {
        assert_eq!(ConvoyError::Storage("x".into()).category(), "store");
        assert_eq!(
            ConvoyError::ConsumerMismatch {
                id: Uuid::nil(),
                stored: "a".into(),
                reported: "b".into(),
            }
            .category(),
            "protocol"
        );
        assert_eq!(ConvoyError::ConsumerNotSubscribed("c".into()).category(), "lock");
    }
}
