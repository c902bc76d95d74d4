use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use talksy_gateway::messaging::{deliver, participant_row};
use talksy_gateway::store::blocking;
use talksy_types::api::{Claims, SendMessageRequest, StartConversationRequest, StartConversationResponse};
use talksy_types::models::sort_directory;

use crate::auth::AppState;
use crate::error::status;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Only messages with a larger `seq` are returned.
    pub after: Option<i64>,
}

/// GET /conversations — the caller's directory, most recent first.
pub async fn list_directory(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let mut rows = blocking(&state.hub.db, move |db| db.list_directory(claims.sub))
        .await
        .map_err(status)?;
    sort_directory(&mut rows);
    Ok(Json(rows))
}

/// POST /conversations — find or create the conversation with a peer.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let creation = state
        .hub
        .creator
        .find_or_create(claims.sub, req.peer_user_id)
        .await
        .map_err(status)?;

    let code = if creation.created {
        info!("{} started conversation {}", claims.username, creation.conversation_id);
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        code,
        Json(StartConversationResponse {
            conversation_id: creation.conversation_id,
            created: creation.created,
        }),
    ))
}

/// POST /conversations/{id}/seen
pub async fn mark_seen(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    participant_row(&state.hub, claims.sub, conversation_id)
        .await
        .map_err(status)?;
    blocking(&state.hub.db, move |db| db.mark_seen(claims.sub, conversation_id))
        .await
        .map_err(status)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    participant_row(&state.hub, claims.sub, conversation_id)
        .await
        .map_err(status)?;

    let after = query.after.unwrap_or(0);
    let messages = blocking(&state.hub.db, move |db| {
        db.list_messages_after(conversation_id, after)
    })
    .await
    .map_err(status)?;

    Ok(Json(messages))
}

/// Same path as a WebSocket send: append, notify open sessions, update
/// both directory rows.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = deliver(&state.hub, claims.sub, conversation_id, req.body)
        .await
        .map_err(status)?;
    Ok((StatusCode::CREATED, Json(message)))
}
