use rusqlite::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A creation invariant was violated: the pair already had a conversation
    /// even though its lock was held.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("user {user_id} does not belong to conversation {conversation_id}")]
    Unauthorized { user_id: Uuid, conversation_id: Uuid },

    /// Busy or locked database. Safe to retry later.
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::Transient(e.to_string())
            }
            _ => Self::Sqlite(e),
        }
    }
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}
