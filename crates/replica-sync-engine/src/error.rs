//! Error types for the sync engine.

use std::time::Duration;

/// Failures reported by the live platform.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The entity exists but this connection may not see it
    #[error("access denied to {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transport failure: {0}")]
    Transport(String),

    /// The platform returned a payload that could not be interpreted
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Failures reported by the replica store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store connection was torn down, typically during shutdown
    #[error("replica store is closed")]
    Closed,

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("failed to (de)serialize {kind} {id}: {reason}")]
    Serialization {
        kind: String,
        id: String,
        reason: String,
    },
}

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// How a failure is treated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blip, rate limit, store unavailable. Abandoned for this pass.
    Transient,
    /// Entity is not visible to us. A normal outcome that counts as zero.
    AccessDenied,
    /// Caused by an intentional teardown. Never escalated.
    Shutdown,
    /// Malformed payloads and similar contract violations. Entity skipped.
    Contract,
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Source(SourceError::AccessDenied(_)) => ErrorClass::AccessDenied,
            SyncError::Source(SourceError::Malformed(_)) => ErrorClass::Contract,
            SyncError::Source(_) => ErrorClass::Transient,
            SyncError::Store(StoreError::Closed) | SyncError::ShuttingDown => ErrorClass::Shutdown,
            SyncError::Store(StoreError::Serialization { .. }) => ErrorClass::Contract,
            SyncError::Store(StoreError::Backend(_)) => ErrorClass::Transient,
            SyncError::InvalidEntity(_) => ErrorClass::Contract,
            SyncError::Internal(_) => ErrorClass::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Source(SourceError::NotFound(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors_per_taxonomy() {
        assert_eq!(
            SyncError::from(SourceError::AccessDenied("c1".into())).class(),
            ErrorClass::AccessDenied
        );
        assert_eq!(
            SyncError::from(SourceError::RateLimited { retry_after: None }).class(),
            ErrorClass::Transient
        );
        assert_eq!(SyncError::from(StoreError::Closed).class(), ErrorClass::Shutdown);
        assert_eq!(
            SyncError::from(SourceError::Malformed("bad json".into())).class(),
            ErrorClass::Contract
        );
        assert_eq!(
            SyncError::Internal(anyhow::anyhow!("boom")).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn not_found_is_detected() {
        assert!(SyncError::from(SourceError::NotFound("m1".into())).is_not_found());
        assert!(!SyncError::ShuttingDown.is_not_found());
    }
}
