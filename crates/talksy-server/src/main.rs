mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use talksy_api::auth::{AppState, AppStateInner, decode_token};
use talksy_api::files::BlobStore;
use talksy_api::routes;
use talksy_db::Database;
use talksy_gateway::{Hub, connection};

use crate::config::ServerConfig;

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    /// Browsers cannot set headers on a WebSocket handshake.
    token: Option<String>,
    /// Conversation to open as soon as the session starts.
    conversation_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talksy=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!(
        "presence window {:?}, heartbeat {:?}, reconcile {:?}",
        config.sync.online_window, config.sync.heartbeat_interval, config.sync.reconcile_interval
    );

    // Init database
    let db = Database::open(&config.db_path)?;
    let hub = Hub::new(Arc::new(db), config.sync.clone());
    let blobs = BlobStore::new(config.blob_dir.clone(), config.public_url.clone()).await?;

    let state: AppState = Arc::new(AppStateInner {
        hub,
        jwt_secret: config.jwt_secret.clone(),
        blobs,
    });

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    let app = routes::router(state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Talksy server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Authenticates before upgrading, so a bad token never gets a socket.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query
        .token
        .or_else(|| bearer.map(|TypedHeader(auth)| auth.token().to_string()));

    let Some(claims) = token.and_then(|t| decode_token(&state.jwt_secret, &t)) else {
        warn!("gateway upgrade rejected: missing or invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let hub = state.hub.clone();
    let initial_conversation = query.conversation_id;
    ws.on_upgrade(move |socket| {
        connection::handle_connection_authenticated(
            socket,
            hub,
            claims.sub,
            claims.username,
            initial_conversation,
        )
    })
}
