// Public imagine/video surface - session-ticket pattern
//
// A POST to /start (authenticated by public key, app key, or a session
// cookie) creates a short-lived single-use ticket; the follow-up SSE GET
// presents only the ticket id, so credentials never appear in URLs. /stop
// discards an unused ticket. Generation itself rides the chat pipeline's
// image-capable model.

use crate::auth;
use crate::chat::{ChatOutcome, ChatParams};
use crate::error::AppError;
use crate::state::AppState;
use crate::tickets::TicketParams;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub prompt: String,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub nsfw: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TicketQuery {
    pub task_id: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub task_id: String,
}

fn start_ticket(
    state: &AppState,
    headers: &HeaderMap,
    request: StartRequest,
) -> Result<Value, AppError> {
    let config = state.config_snapshot();
    auth::verify_public_key(&config, headers, None)?;

    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(AppError::Validation("prompt must not be empty".to_string()));
    }

    let task_id = state.tickets.create(TicketParams {
        prompt,
        aspect_ratio: request.aspect_ratio.unwrap_or_else(|| "2:3".to_string()),
        n: request.n.unwrap_or(1).clamp(1, 4),
        response_format: request
            .response_format
            .unwrap_or_else(|| "url".to_string()),
        nsfw: request.nsfw.unwrap_or(false),
    });
    Ok(json!({ "task_id": task_id }))
}

/// Stream generation for a consumed ticket as SSE.
async fn run_ticket_sse(
    state: Arc<AppState>,
    headers: HeaderMap,
    query: TicketQuery,
) -> Response {
    let config = state.config_snapshot();
    if let Err(e) = auth::verify_public_key(&config, &headers, query.public_key.as_deref()) {
        return e.into_response();
    }

    let Some(ticket) = state.tickets.consume(&query.task_id) else {
        return AppError::Validation("unknown or expired task".to_string()).into_response();
    };

    let mut params = ChatParams::new(
        "grok-imagine",
        vec![json!({"role": "user", "content": ticket.prompt})],
    );
    params.stream = Some(true);

    let outcome = match state.chat.completions(params).await {
        Ok(outcome) => outcome,
        Err(e) => return e.into_response(),
    };
    let ChatOutcome::Stream { frames, .. } = outcome else {
        return AppError::Internal(anyhow::anyhow!("expected a stream")).into_response();
    };

    let body_stream = async_stream::stream! {
        futures::pin_mut!(frames);
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => yield Ok::<_, std::convert::Infallible>(frame.into_bytes()),
                Err(e) => {
                    let frame = format!("data: {}\n\n", e.to_body());
                    yield Ok(frame.into_bytes());
                    break;
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn stop_ticket(state: &AppState, headers: &HeaderMap, request: StopRequest) -> Response {
    let config = state.config_snapshot();
    if let Err(e) = auth::verify_public_key(&config, headers, None) {
        return e.into_response();
    }
    let stopped = state.tickets.remove(&request.task_id);
    Json(json!({ "stopped": stopped })).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Imagine
// ─────────────────────────────────────────────────────────────────────────────

pub async fn imagine_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Response {
    match start_ticket(&state, &headers, request) {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn imagine_sse(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TicketQuery>,
) -> Response {
    run_ticket_sse(state, headers, query).await
}

pub async fn imagine_stop(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StopRequest>,
) -> Response {
    stop_ticket(&state, &headers, request)
}

pub async fn imagine_config(State(state): State<Arc<AppState>>) -> Response {
    let config = state.config_snapshot();
    Json(json!({
        "enabled": config.app.public_enabled || !config.app.public_key.is_empty(),
        "requires_key": !config.app.public_key.is_empty(),
        "ticket_ttl_sec": config.session.ticket_ttl_sec,
    }))
    .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Video
//
// Video requests share the ticket flow and the image-capable chat model;
// the upstream's dedicated video transport is not part of this gateway.
// ─────────────────────────────────────────────────────────────────────────────

pub async fn video_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Response {
    match start_ticket(&state, &headers, request) {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn video_sse(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TicketQuery>,
) -> Response {
    run_ticket_sse(state, headers, query).await
}

pub async fn video_stop(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StopRequest>,
) -> Response {
    stop_ticket(&state, &headers, request)
}
