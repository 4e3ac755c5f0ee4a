use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use push::{HttpPushTransport, PushDispatcher};
use server_api::{ApiContext, StorageTokenCleanup};
use shared::{
    domain::Username,
    error::{ApiError, ErrorCode},
};
use storage::Storage;
use tracing::{error, info};

mod app_state;
mod config;
mod connection;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: Username,
    #[serde(default)]
    push_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct UserSummary {
    username: Username,
    is_online: bool,
    total_yos_received: i64,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct FriendPairRequest {
    from_user: Username,
    to_user: Username,
}

#[derive(Debug, Deserialize)]
struct BlockRequest {
    username: Username,
    target: Username,
}

#[derive(Debug, Serialize)]
struct YoEntry {
    from: Username,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct YoHistoryResponse {
    yos_received: Vec<YoEntry>,
    total_yos_received: i64,
}

const YO_HISTORY_LIMIT: u32 = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let transport = Arc::new(HttpPushTransport::new(
        &settings.push_api_url,
        settings.push_access_token.clone(),
    ));
    let cleanup = Arc::new(StorageTokenCleanup(storage.clone()));
    let push = PushDispatcher::new(
        transport,
        cleanup,
        Duration::from_secs(settings.push_receipt_delay_seconds),
    );

    let ctx = ApiContext::new(storage, push);
    let app = build_router(Arc::new(AppState { ctx }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", post(create_user).get(list_users))
        .route("/users/block", post(block_user))
        .route("/users/unblock", post(unblock_user))
        .route("/users/:username", get(get_user))
        .route("/users/:username/yos", get(get_yos))
        .route("/users/:username/blocked", get(get_blocked))
        .route("/friends", post(add_friend).delete(remove_friend))
        .route("/friends/:username", get(list_friends))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::serve(state, socket))
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<UserSummary>, (StatusCode, Json<ApiError>)> {
    if req.username.as_str().trim().is_empty() {
        return Err(validation("username cannot be empty"));
    }

    state
        .ctx
        .storage
        .create_user(&req.username)
        .await
        .map_err(internal)?;
    if let Some(token) = &req.push_token {
        state
            .ctx
            .storage
            .set_delivery_token(&req.username, Some(token))
            .await
            .map_err(internal)?;
    }

    let user = state
        .ctx
        .storage
        .find_user(&req.username)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("user not found"))?;
    Ok(Json(summary(&state, user)))
}

async fn list_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UserSummary>>, (StatusCode, Json<ApiError>)> {
    let users = state.ctx.storage.list_users().await.map_err(internal)?;
    Ok(Json(
        users.into_iter().map(|u| summary(&state, u)).collect(),
    ))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<UserSummary>, (StatusCode, Json<ApiError>)> {
    let username = Username(username);
    let user = state
        .ctx
        .storage
        .find_user(&username)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("user not found"))?;
    Ok(Json(summary(&state, user)))
}

async fn get_yos(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<YoHistoryResponse>, (StatusCode, Json<ApiError>)> {
    let username = Username(username);
    let user = state
        .ctx
        .storage
        .find_user(&username)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("user not found"))?;

    let yos = state
        .ctx
        .storage
        .recent_yos(&username, YO_HISTORY_LIMIT)
        .await
        .map_err(internal)?;

    Ok(Json(YoHistoryResponse {
        yos_received: yos
            .into_iter()
            .map(|yo| YoEntry {
                from: yo.sender,
                timestamp: yo.received_at,
            })
            .collect(),
        total_yos_received: user.total_yos_received,
    }))
}

async fn get_blocked(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<Vec<Username>>, (StatusCode, Json<ApiError>)> {
    let username = Username(username);
    ensure_user_exists(&state, &username).await?;
    let blocked = state
        .ctx
        .storage
        .blocked_by(&username)
        .await
        .map_err(internal)?;
    Ok(Json(blocked))
}

async fn add_friend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FriendPairRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    if req.from_user == req.to_user {
        return Err(validation("cannot add yourself as a friend"));
    }
    ensure_user_exists(&state, &req.from_user).await?;
    ensure_user_exists(&state, &req.to_user).await?;

    state
        .ctx
        .storage
        .add_friend(&req.from_user, &req.to_user)
        .await
        .map_err(internal)?;

    // Side event passed through to the recipient's live channel, if any.
    server_api::notify_friend_added(&state.ctx, &req.from_user, &req.to_user);

    Ok(Json(serde_json::json!({ "success": true })))
}

async fn remove_friend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FriendPairRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    state
        .ctx
        .storage
        .remove_friend(&req.from_user, &req.to_user)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn list_friends(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<Vec<Username>>, (StatusCode, Json<ApiError>)> {
    let username = Username(username);
    ensure_user_exists(&state, &username).await?;
    let friends = state
        .ctx
        .storage
        .friends_of(&username)
        .await
        .map_err(internal)?;
    Ok(Json(friends))
}

async fn block_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    if req.username == req.target {
        return Err(validation("cannot block yourself"));
    }
    ensure_user_exists(&state, &req.username).await?;

    state
        .ctx
        .storage
        .block_user(&req.username, &req.target)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn unblock_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    state
        .ctx
        .storage
        .unblock_user(&req.username, &req.target)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

fn summary(state: &Arc<AppState>, user: storage::StoredUser) -> UserSummary {
    UserSummary {
        // Live presence wins over the persisted flag, which can lag a crash.
        is_online: state.ctx.presence.is_online(&user.username) || user.is_online,
        username: user.username,
        total_yos_received: user.total_yos_received,
        last_seen: user.last_seen,
    }
}

async fn ensure_user_exists(
    state: &Arc<AppState>,
    username: &Username,
) -> Result<(), (StatusCode, Json<ApiError>)> {
    state
        .ctx
        .storage
        .find_user(username)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("user not found"))?;
    Ok(())
}

fn internal(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, err.to_string())),
    )
}

fn validation(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

fn not_found(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(ErrorCode::NotFound, message)),
    )
}
