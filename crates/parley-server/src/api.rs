//! REST endpoints for accounts, chats and message history.
//!
//! Store calls (and bcrypt) are synchronous work and run on the blocking pool.
//! Messages posted here are persisted through the same gateway as the
//! websocket path and fanned out through the hub.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info};

use parley_core::envelope::BroadcastEnvelope;
use parley_core::{ConversationId, Message, UserId};
use parley_store::chats::{Chat, ChatRepo};
use parley_store::messages::MessageRepo;
use parley_store::users::UserRepo;
use parley_store::{Database, StoreError};
use parley_telemetry::names;

use crate::auth::{AuthUser, TokenPair};
use crate::error::ApiError;
use crate::server::AppState;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 100;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/chats", get(list_chats))
        .route("/chats/private", post(create_private_chat))
        .route("/chats/group", post(create_group_chat))
        .route("/messages/send", post(send_message))
        .route("/messages/get", get(get_messages))
}

async fn blocking<T, F>(db: &Database, f: F) -> Result<T, ApiError>
where
    F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(db))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Public view of a new account; never carries the hash.
#[derive(Debug, Serialize)]
pub struct RegisteredUser {
    pub id: UserId,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePrivateChatRequest {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupChatRequest {
    pub name: String,
    #[serde(default)]
    pub participants: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(alias = "chat_id")]
    pub conversation_id: ConversationId,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub chat_id: ConversationId,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Validated `(limit, offset)` for a history page.
pub fn page_bounds(limit: Option<i64>, offset: Option<i64>) -> Result<(u32, u32), ApiError> {
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit <= 0 {
        return Err(ApiError::bad_request("limit must be positive"));
    }
    let offset = offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::bad_request("offset must not be negative"));
    }
    let offset = u32::try_from(offset).map_err(|_| ApiError::bad_request("offset too large"))?;
    Ok((limit.min(MAX_HISTORY_LIMIT) as u32, offset))
}

/// POST /api/register
async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisteredUser>), ApiError> {
    let cost = state.config.password_hash_cost;
    let user = blocking(&state.db, move |db| {
        UserRepo::new(db)
            .with_hash_cost(cost)
            .register(&req.username, &req.email, &req.password)
    })
    .await?;
    info!(user_id = %user.id, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisteredUser {
            id: user.id,
            username: user.username,
            email: user.email,
        }),
    ))
}

/// POST /api/login
async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let checked = blocking(&state.db, move |db| {
        let Some(creds) = UserRepo::new(db).find_credentials(&req.email)? else {
            return Ok(None);
        };
        let valid = creds.verify(&req.password)?;
        Ok(Some((creds.user.id, valid)))
    })
    .await?;

    match checked {
        None => Err(ApiError::not_found("user not found")),
        Some((_, false)) => Err(ApiError::unauthorized("invalid password")),
        Some((user_id, true)) => {
            info!(%user_id, "user logged in");
            Ok(Json(state.tokens.issue_pair(user_id)?))
        }
    }
}

/// GET /api/chats
async fn list_chats(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<Chat>>, ApiError> {
    let chats = blocking(&state.db, move |db| ChatRepo::new(db).list_for_user(user_id)).await?;
    Ok(Json(chats))
}

/// POST /api/chats/private
async fn create_private_chat(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<CreatePrivateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), ApiError> {
    let peer_id = req.user_id;
    let chat = blocking(&state.db, move |db| ChatRepo::new(db).create_private(user_id, peer_id)).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

/// POST /api/chats/group
async fn create_group_chat(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<CreateGroupChatRequest>,
) -> Result<(StatusCode, Json<Chat>), ApiError> {
    let chat = blocking(&state.db, move |db| {
        ChatRepo::new(db).create_group(user_id, &req.name, &req.participants)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

/// POST /api/messages/send
async fn send_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let started = Instant::now();
    let message = state
        .gateway
        .append(req.conversation_id, user_id, &req.content)
        .await?;

    state.metrics.counter_inc(names::MESSAGES_PERSISTED_TOTAL, &[], 1);
    state.metrics.histogram_observe(
        names::MESSAGE_PERSIST_DURATION_MS,
        &[],
        started.elapsed().as_secs_f64() * 1000.0,
    );

    match BroadcastEnvelope::new_message(&message) {
        Ok(envelope) => state.hub.broadcast(envelope),
        Err(e) => error!(error = %e, message_id = %message.id, "failed to encode message"),
    }
    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /api/messages/get
async fn get_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let (limit, offset) = page_bounds(query.limit, query.offset)?;
    let chat_id = query.chat_id;
    let messages = blocking(&state.db, move |db| {
        MessageRepo::new(db).list(chat_id, user_id, limit, offset)
    })
    .await?;
    Ok(Json(messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use parley_core::envelope::Outbound;
    use parley_core::ConnectionId;

    use crate::hub::SessionHandle;
    use crate::mailbox;
    use crate::server::{build_router, test_state};

    struct Fixture {
        state: AppState,
        app: Router,
        alice: (UserId, String),
        bob: (UserId, String),
        carol: (UserId, String),
    }

    fn fixture() -> Fixture {
        let state = test_state();
        let users = UserRepo::new(state.db.clone());
        let make = |name: &str| {
            let user = users.create(name, &format!("{name}@example.com")).unwrap();
            let token = state.tokens.issue(user.id).unwrap();
            (user.id, token)
        };
        let alice = make("alice");
        let bob = make("bob");
        let carol = make("carol");
        let app = build_router(state.clone());
        Fixture {
            state,
            app,
            alice,
            bob,
            carol,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn private_chat(f: &Fixture) -> i64 {
        let (status, chat) = call(
            &f.app,
            "POST",
            "/api/chats/private",
            Some(&f.alice.1),
            Some(json!({ "user_id": f.bob.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        chat["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn register_then_login_issues_usable_tokens() {
        let f = fixture();
        let (status, user) = call(
            &f.app,
            "POST",
            "/api/register",
            None,
            Some(json!({ "username": "dana", "email": "Dana@Example.com", "password": "s3cret" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(user["username"], "dana");
        assert_eq!(user["email"], "dana@example.com");
        assert!(user["id"].is_i64());
        assert!(user.get("password_hash").is_none());

        let (status, tokens) = call(
            &f.app,
            "POST",
            "/api/login",
            None,
            Some(json!({ "email": "dana@example.com", "password": "s3cret" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let access = tokens["access_token"].as_str().unwrap();
        let refresh = tokens["refresh_token"].as_str().unwrap();

        let (status, chats) = call(&f.app, "GET", "/api/chats", Some(access), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(chats.as_array().unwrap().is_empty());
        let (status, _) = call(&f.app, "GET", "/api/chats", Some(refresh), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_rejects_taken_email() {
        let f = fixture();
        let (status, body) = call(
            &f.app,
            "POST",
            "/api/register",
            None,
            Some(json!({ "username": "alice2", "email": "ALICE@example.com", "password": "pw" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "email is already registered");

        let (status, _) = call(
            &f.app,
            "POST",
            "/api/register",
            None,
            Some(json!({ "username": "erin", "email": "erin@example.com", "password": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_distinguishes_unknown_user_and_bad_password() {
        let f = fixture();
        call(
            &f.app,
            "POST",
            "/api/register",
            None,
            Some(json!({ "username": "finn", "email": "finn@example.com", "password": "right" })),
        )
        .await;

        let login = |email: &str, password: &str| json!({ "email": email, "password": password });
        let (status, body) = call(&f.app, "POST", "/api/login", None, Some(login("ghost@example.com", "x"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "user not found");

        let (status, body) = call(&f.app, "POST", "/api/login", None, Some(login("finn@example.com", "wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid password");

        // Accounts created without a password cannot log in.
        let (status, _) = call(&f.app, "POST", "/api/login", None, Some(login("alice@example.com", ""))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn page_bounds_defaults_and_caps() {
        assert_eq!(page_bounds(None, None).unwrap(), (50, 0));
        assert_eq!(page_bounds(Some(500), Some(10)).unwrap(), (100, 10));
        assert_eq!(page_bounds(Some(0), None).unwrap_err().status, StatusCode::BAD_REQUEST);
        assert_eq!(page_bounds(None, Some(-1)).unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requests_without_token_are_unauthorized() {
        let f = fixture();
        let (status, body) = call(&f.app, "GET", "/api/chats", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let (status, _) = call(&f.app, "GET", "/api/chats", Some("not-a-jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn private_chat_is_created_once_and_listed_for_both() {
        let f = fixture();
        let first = private_chat(&f).await;

        let (status, again) = call(
            &f.app,
            "POST",
            "/api/chats/private",
            Some(&f.bob.1),
            Some(json!({ "user_id": f.alice.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(again["id"].as_i64(), Some(first));
        assert_eq!(again["kind"], "private");

        let (_, chats) = call(&f.app, "GET", "/api/chats", Some(&f.bob.1), None).await;
        assert_eq!(chats.as_array().unwrap().len(), 1);
        let (_, chats) = call(&f.app, "GET", "/api/chats", Some(&f.carol.1), None).await;
        assert!(chats.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn private_chat_with_self_is_rejected() {
        let f = fixture();
        let (status, _) = call(
            &f.app,
            "POST",
            "/api/chats/private",
            Some(&f.alice.1),
            Some(json!({ "user_id": f.alice.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn group_chat_includes_creator() {
        let f = fixture();
        let (status, chat) = call(
            &f.app,
            "POST",
            "/api/chats/group",
            Some(&f.alice.1),
            Some(json!({ "name": "team", "participants": [f.bob.0, f.carol.0] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(chat["name"], "team");

        let chat_id = ConversationId::new(chat["id"].as_i64().unwrap());
        let members = ChatRepo::new(f.state.db.clone()).members(chat_id).unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.contains(&f.alice.0));
    }

    #[tokio::test]
    async fn group_chat_with_unknown_participant_fails() {
        let f = fixture();
        let (status, _) = call(
            &f.app,
            "POST",
            "/api/chats/group",
            Some(&f.alice.1),
            Some(json!({ "name": "team", "participants": [9999] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn send_then_read_history() {
        let f = fixture();
        let chat = private_chat(&f).await;

        for content in ["one", "two", "three"] {
            let (status, message) = call(
                &f.app,
                "POST",
                "/api/messages/send",
                Some(&f.alice.1),
                Some(json!({ "chat_id": chat, "content": content })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(message["content"], content);
            assert_eq!(message["sender_id"].as_i64(), Some(f.alice.0.get()));
        }

        let uri = format!("/api/messages/get?chat_id={chat}&limit=2");
        let (status, page) = call(&f.app, "GET", &uri, Some(&f.bob.1), None).await;
        assert_eq!(status, StatusCode::OK);
        let contents: Vec<&str> = page
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, ["three", "two"]);

        let uri = format!("/api/messages/get?chat_id={chat}&limit=2&offset=2");
        let (_, page) = call(&f.app, "GET", &uri, Some(&f.bob.1), None).await;
        assert_eq!(page[0]["content"], "one");
        assert_eq!(
            f.state.metrics.counter_get(names::MESSAGES_PERSISTED_TOTAL, &[]),
            3
        );
    }

    #[tokio::test]
    async fn non_members_are_forbidden() {
        let f = fixture();
        let chat = private_chat(&f).await;

        let (status, body) = call(
            &f.app,
            "POST",
            "/api/messages/send",
            Some(&f.carol.1),
            Some(json!({ "conversation_id": chat, "content": "let me in" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "user is not a member of the chat");

        let uri = format!("/api/messages/get?chat_id={chat}");
        let (status, _) = call(&f.app, "GET", &uri, Some(&f.carol.1), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn history_rejects_bad_paging() {
        let f = fixture();
        let chat = private_chat(&f).await;

        let uri = format!("/api/messages/get?chat_id={chat}&limit=0");
        let (status, _) = call(&f.app, "GET", &uri, Some(&f.alice.1), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/api/messages/get?chat_id={chat}&offset=-5");
        let (status, _) = call(&f.app, "GET", &uri, Some(&f.alice.1), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blank_content_is_rejected() {
        let f = fixture();
        let chat = private_chat(&f).await;
        let (status, _) = call(
            &f.app,
            "POST",
            "/api/messages/send",
            Some(&f.alice.1),
            Some(json!({ "conversation_id": chat, "content": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rest_posts_fan_out_to_connected_sessions() {
        let f = fixture();
        let chat = private_chat(&f).await;

        let (mailbox, mut rx) = mailbox::channel(8);
        let session = Arc::new(SessionHandle::new(
            ConnectionId::new(),
            f.bob.0,
            [ConversationId::new(chat)].into_iter().collect(),
            mailbox,
        ));
        f.state.hub.register(session);

        let (status, sent) = call(
            &f.app,
            "POST",
            "/api/messages/send",
            Some(&f.alice.1),
            Some(json!({ "conversation_id": chat, "content": "hi bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let frame = rx.recv().await.unwrap();
        match serde_json::from_str::<Outbound>(&frame).unwrap() {
            Outbound::NewMessage(message) => {
                assert_eq!(serde_json::to_value(&message).unwrap(), sent);
            }
            other => panic!("expected new_message, got {other:?}"),
        }
    }
}
