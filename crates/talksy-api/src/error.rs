use axum::http::StatusCode;
use tracing::error;

use talksy_gateway::SyncError;

/// Maps the failure taxonomy onto HTTP. Internal details stay in the log.
pub fn status(err: SyncError) -> StatusCode {
    match err {
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::Unauthorized => StatusCode::FORBIDDEN,
        SyncError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SyncError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::Conflict(msg) => {
            error!("conflict surfaced to client: {}", msg);
            StatusCode::CONFLICT
        }
        SyncError::Internal(msg) => {
            error!("internal error: {}", msg);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
