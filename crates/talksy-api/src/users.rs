use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use talksy_gateway::presence::is_online_at;
use talksy_gateway::store::blocking;
use talksy_types::api::{Claims, ProfileUpdateRequest, UserProfile, UserSearchQuery};
use talksy_types::models::User;

use crate::auth::AppState;
use crate::error::status;

const MAX_NAME_LEN: usize = 64;
const MAX_BIO_LEN: usize = 500;

fn profile(state: &AppState, user: User) -> UserProfile {
    let online = is_online_at(user.last_active, Utc::now(), state.hub.presence.window());
    UserProfile::from_user(user, online)
}

/// GET /users?q= — everyone but the caller, by name.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<UserSearchQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let users = blocking(&state.hub.db, move |db| {
        db.list_users(claims.sub, query.q.as_deref())
    })
    .await
    .map_err(status)?;

    let profiles: Vec<UserProfile> = users.into_iter().map(|u| profile(&state, u)).collect();
    Ok(Json(profiles))
}

pub async fn get_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    get_profile(&state, claims.sub).await.map(Json)
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    get_profile(&state, user_id).await.map(Json)
}

async fn get_profile(state: &AppState, user_id: Uuid) -> Result<UserProfile, StatusCode> {
    let user = blocking(&state.hub.db, move |db| db.get_user(user_id))
        .await
        .map_err(status)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(profile(state, user))
}

/// PATCH /users/me — only the fields present are changed.
pub async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ProfileUpdateRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = req.name.map(|s| s.trim().to_string());
    let avatar = req.avatar.map(|s| s.trim().to_string());
    let bio = req.bio.map(|s| s.trim().to_string());

    if name.as_ref().is_some_and(|n| n.is_empty() || n.chars().count() > MAX_NAME_LEN) {
        return Err(StatusCode::BAD_REQUEST);
    }
    if bio.as_ref().is_some_and(|b| b.chars().count() > MAX_BIO_LEN) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let user = blocking(&state.hub.db, move |db| {
        db.update_profile(claims.sub, name.as_deref(), avatar.as_deref(), bio.as_deref())
    })
    .await
    .map_err(status)?;

    Ok(Json(profile(&state, user)))
}

/// POST /presence/heartbeat — for clients that poll instead of holding a socket.
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    state.hub.presence.heartbeat(claims.sub).await.map_err(status)?;
    Ok(StatusCode::NO_CONTENT)
}
