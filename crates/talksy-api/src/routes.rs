use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

use crate::auth::{self, AppState};
use crate::conversations;
use crate::files::{self, MAX_BLOB_SIZE};
use crate::middleware::require_auth;
use crate::users;

/// Every REST route. The WebSocket gateway is mounted by the server binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/files/{blob_id}", get(files::download))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/users", get(users::list_users))
        .route("/users/me", get(users::get_me).patch(users::update_me))
        .route("/users/{user_id}", get(users::get_user))
        .route("/presence/heartbeat", post(users::heartbeat))
        .route(
            "/conversations",
            get(conversations::list_directory).post(conversations::start_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages).post(conversations::send_message),
        )
        .route("/conversations/{conversation_id}/seen", post(conversations::mark_seen))
        .route(
            "/files",
            post(files::upload).layer(DefaultBodyLimit::max(MAX_BLOB_SIZE)),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use talksy_db::Database;
    use talksy_gateway::{Hub, SyncConfig};

    use super::*;
    use crate::auth::AppStateInner;
    use crate::files::BlobStore;

    async fn test_app() -> Router {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let hub = Hub::new(db, SyncConfig::default());
        let dir = std::env::temp_dir().join(format!("talksy-blobs-{}", Uuid::new_v4()));
        let blobs = BlobStore::new(dir, "http://talksy.test").await.unwrap();
        router(Arc::new(AppStateInner {
            hub,
            jwt_secret: "test-secret".into(),
            blobs,
        }))
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Registers and returns (user_id, token).
    async fn register(app: &Router, username: &str) -> (String, String) {
        let (status, body) = call(
            app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({ "username": username, "password": "hunter2hunter2" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        (
            body["user_id"].as_str().unwrap().to_string(),
            body["token"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn register_login_and_profile() {
        let app = test_app().await;
        let (alice_id, _) = register(&app, "alice").await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({ "username": "alice", "password": "another-password" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, login) = call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "username": "alice", "password": "hunter2hunter2" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(login["user_id"], alice_id.as_str());
        assert_eq!(login["profile_complete"], false);
        let token = login["token"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "username": "alice", "password": "wrong-password" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, me) = call(
            &app,
            Method::PATCH,
            "/users/me",
            Some(&token),
            Some(json!({ "name": "Alice", "avatar": "http://talksy.test/files/a" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["name"], "Alice");
        assert_eq!(me["profile_complete"], true);

        let (status, _) = call(
            &app,
            Method::PATCH,
            "/users/me",
            Some(&token),
            Some(json!({ "name": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let app = test_app().await;
        let (status, _) = call(&app, Method::GET, "/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            call(&app, Method::GET, "/conversations", Some("not-a-jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn conversation_flow() {
        let app = test_app().await;
        let (alice_id, alice) = register(&app, "alice").await;
        let (bob_id, bob) = register(&app, "bob").await;
        let (_, carol) = register(&app, "carol").await;

        let (status, started) = call(
            &app,
            Method::POST,
            "/conversations",
            Some(&alice),
            Some(json!({ "peer_user_id": bob_id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(started["created"], true);
        let cid = started["conversation_id"].as_str().unwrap().to_string();

        // Bob starting from his side lands on the same conversation.
        let (status, again) = call(
            &app,
            Method::POST,
            "/conversations",
            Some(&bob),
            Some(json!({ "peer_user_id": alice_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["conversation_id"], cid.as_str());
        assert_eq!(again["created"], false);

        let messages_uri = format!("/conversations/{}/messages", cid);
        let (status, sent) = call(
            &app,
            Method::POST,
            &messages_uri,
            Some(&alice),
            Some(json!({ "body": { "kind": "text", "content": "hello" } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["sender_id"], alice_id.as_str());

        let (_, rows) = call(&app, Method::GET, "/conversations", Some(&bob), None).await;
        assert_eq!(rows[0]["conversation_id"], cid.as_str());
        assert_eq!(rows[0]["peer_user_id"], alice_id.as_str());
        assert_eq!(rows[0]["last_message_preview"], "hello");
        assert_eq!(rows[0]["unread"], true);

        let (_, rows) = call(&app, Method::GET, "/conversations", Some(&alice), None).await;
        assert_eq!(rows[0]["unread"], false);

        let (status, messages) =
            call(&app, Method::GET, &messages_uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages.as_array().unwrap().len(), 1);

        let after = format!("{}?after={}", messages_uri, sent["seq"]);
        let (_, newer) = call(&app, Method::GET, &after, Some(&bob), None).await;
        assert!(newer.as_array().unwrap().is_empty());

        let seen_uri = format!("/conversations/{}/seen", cid);
        let (status, _) = call(&app, Method::POST, &seen_uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, rows) = call(&app, Method::GET, "/conversations", Some(&bob), None).await;
        assert_eq!(rows[0]["unread"], false);

        // Carol is not a participant.
        let (status, _) = call(&app, Method::GET, &messages_uri, Some(&carol), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(
            &app,
            Method::POST,
            &messages_uri,
            Some(&carol),
            Some(json!({ "body": { "kind": "text", "content": "hi" } })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let missing = format!("/conversations/{}/messages", Uuid::new_v4());
        let (status, _) = call(&app, Method::GET, &missing, Some(&alice), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn starting_with_yourself_is_rejected() {
        let app = test_app().await;
        let (alice_id, alice) = register(&app, "alice").await;
        let (status, _) = call(
            &app,
            Method::POST,
            "/conversations",
            Some(&alice),
            Some(json!({ "peer_user_id": alice_id })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn heartbeat_makes_user_online() {
        let app = test_app().await;
        let (alice_id, alice) = register(&app, "alice").await;
        let (_, bob) = register(&app, "bob").await;

        let uri = format!("/users/{}", alice_id);
        let (_, profile) = call(&app, Method::GET, &uri, Some(&bob), None).await;
        assert_eq!(profile["online"], false);
        assert!(profile["last_seen"].is_null());

        let (status, _) =
            call(&app, Method::POST, "/presence/heartbeat", Some(&alice), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, profile) = call(&app, Method::GET, &uri, Some(&bob), None).await;
        assert_eq!(profile["online"], true);

        let (_, listed) = call(&app, Method::GET, "/users?q=ALI", Some(&bob), None).await;
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["username"], "alice");
    }

    #[tokio::test]
    async fn upload_then_download() {
        let app = test_app().await;
        let (_, alice) = register(&app, "alice").await;

        let req = Request::builder()
            .method(Method::POST)
            .uri("/files")
            .header(header::AUTHORIZATION, format!("Bearer {}", alice))
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(vec![0x89, b'P', b'N', b'G', 1, 2, 3]))
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let uploaded: Value = serde_json::from_slice(&bytes).unwrap();
        let id = uploaded["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 64);
        assert_eq!(uploaded["url"], format!("http://talksy.test/files/{}", id));

        let req = Request::builder()
            .uri(format!("/files/{}", id))
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], &[0x89, b'P', b'N', b'G', 1, 2, 3]);

        let (status, _) = call(&app, Method::GET, "/files/..%2Fetc", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = format!("/files/{}", "0".repeat(64));
        let (status, _) = call(&app, Method::GET, &unknown, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
