use thiserror::Error;

use talksy_db::StoreError;

/// Failure taxonomy seen by sessions and handlers.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not a participant of this conversation")]
    Unauthorized,

    #[error("{0}")]
    InvalidInput(String),

    /// Retried by the next scheduled tick, never immediately.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::Unauthorized { .. } => Self::Unauthorized,
            StoreError::Transient(msg) => Self::Transient(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("store task failed: {}", e))
    }
}
