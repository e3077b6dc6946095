// Admin surface - login, key/token CRUD, stats, logs, conversations
//
// Everything here is gated by the app key (bearer) or a signed admin
// session cookie. Secrets are masked on the way out.

use crate::api_keys::mask_key;
use crate::auth;
use crate::error::AppError;
use crate::state::AppState;
use crate::token::mask_token;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

fn guard(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    auth::verify_app_key(&state.config_snapshot(), headers)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub app_key: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Response {
    let config = state.config_snapshot();
    if !auth::constant_time_eq(&request.app_key, &config.app.app_key) {
        return AppError::Auth("Invalid app key".to_string()).into_response();
    }

    let ttl_secs = (config.session.admin_ttl_hours * 3600.0) as i64;
    let token = auth::build_session_token(&config.app.session_secret, "admin", ttl_secs);
    let cookie = auth::session_cookie(
        auth::ADMIN_SESSION_COOKIE,
        &token,
        ttl_secs.max(600),
        auth::request_is_secure(&headers),
    );

    let mut response = Json(json!({"ok": true})).into_response();
    if let Ok(value) = cookie.parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

pub async fn logout() -> Response {
    let mut response = Json(json!({"ok": true})).into_response();
    if let Ok(value) = auth::clear_cookie(auth::ADMIN_SESSION_COOKIE).parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

pub async fn get_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let config = state.config_snapshot();
    let mut value = serde_json::to_value(&config).unwrap_or_else(|_| json!({}));
    // Secrets never leave through this endpoint
    value["app"]["session_secret"] = json!("***");
    value["app"]["app_key"] = json!("***");
    value["app"]["api_key"] = json!(mask_key(&config.app.api_key));
    Json(value).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// API keys
// ─────────────────────────────────────────────────────────────────────────────

pub async fn list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let keys: Vec<Value> = state
        .api_keys
        .list()
        .await
        .into_iter()
        .map(|k| {
            json!({
                "key": k.key,
                "key_masked": mask_key(&k.key),
                "name": k.name,
                "created_at": k.created_at,
                "is_active": k.is_active,
                "usage_count": k.usage_count,
                "last_used_at": k.last_used_at,
            })
        })
        .collect();
    Json(json!({ "keys": keys })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddKeyRequest {
    #[serde(default)]
    pub name: String,
}

pub async fn add_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AddKeyRequest>,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let key = state.api_keys.add(&request.name).await;
    Json(json!({ "key": key })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DeleteKeysRequest {
    pub keys: Vec<String>,
}

pub async fn delete_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DeleteKeysRequest>,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let deleted = state.api_keys.delete(&request.keys).await;
    Json(json!({ "deleted": deleted })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct UpdateKeyRequest {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

pub async fn update_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<UpdateKeyRequest>,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let updated = state
        .api_keys
        .update(&request.key, request.name.as_deref(), request.is_active)
        .await;
    Json(json!({ "updated": updated })).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokens
// ─────────────────────────────────────────────────────────────────────────────

pub async fn list_tokens(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let pools = state.tokens.list_all().await;
    let stats = state.tokens.stats().await;
    let pools: Value = pools
        .into_iter()
        .map(|(name, tokens)| {
            let tokens: Vec<Value> = tokens
                .into_iter()
                .map(|t| {
                    json!({
                        "token_masked": mask_token(&t.token),
                        "token": t.token,
                        "quota": t.quota,
                        "status": t.status,
                        "cooldown_until": t.cooldown_until,
                        "cooldown_requests": t.cooldown_requests,
                        "consecutive_failures": t.consecutive_failures,
                        "last_used_at": t.last_used_at,
                    })
                })
                .collect();
            (name, json!(tokens))
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();
    Json(json!({ "pools": pools, "stats": stats })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddTokenRequest {
    pub pool: String,
    pub token: String,
}

pub async fn add_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AddTokenRequest>,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    if request.pool.is_empty() || request.token.is_empty() {
        return AppError::Validation("pool and token are required".to_string()).into_response();
    }
    state.tokens.add(&request.pool, &request.token).await;
    Json(json!({"ok": true})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DeleteTokenRequest {
    pub token: String,
}

pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DeleteTokenRequest>,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let removed = state.tokens.remove(&request.token).await;
    Json(json!({ "removed": removed })).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats / logs / conversations / breaker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_hours() -> i64 {
    24
}

fn default_days() -> i64 {
    7
}

pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let snapshot = state
        .stats
        .snapshot(query.hours.clamp(1, 48), query.days.clamp(1, 30))
        .await;
    Json(snapshot).into_response()
}

pub async fn reset_stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    match state.stats.reset().await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => AppError::Internal(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    Json(state.request_log.list(query.limit, query.offset).await).into_response()
}

pub async fn clear_logs(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    match state.request_log.clear().await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => AppError::Internal(e).into_response(),
    }
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    let conversations: Vec<Value> = state
        .conversations
        .list()
        .await
        .into_iter()
        .map(|(id, c)| {
            json!({
                "id": id,
                "conversation_id": c.conversation_id,
                "token_masked": mask_token(&c.token),
                "message_count": c.message_count,
                "created_at": c.created_at,
                "updated_at": c.updated_at,
                "has_share_link": !c.share_link_id.is_empty(),
            })
        })
        .collect();
    let stats = state.conversations.stats().await;
    Json(json!({ "conversations": conversations, "stats": stats })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DeleteConversationQuery {
    #[serde(default)]
    pub id: Option<String>,
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DeleteConversationQuery>,
) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    match query.id {
        Some(id) => {
            let deleted = state.conversations.delete(&id).await;
            Json(json!({ "deleted": deleted })).into_response()
        }
        None => {
            state.conversations.clear().await;
            Json(json!({"ok": true})).into_response()
        }
    }
}

pub async fn get_breaker(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = guard(&state, &headers) {
        return e.into_response();
    }
    match &state.breaker {
        Some(breaker) => Json(breaker.snapshot().await).into_response(),
        None => Json(json!({"enabled": false})).into_response(),
    }
}
