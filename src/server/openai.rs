// OpenAI-compatible handlers
//
// /v1/chat/completions accepts the standard request shape plus two gateway
// extensions: `reasoning_effort` (none disables think output) and
// `conversation_id` (explicit context pinning). Streaming responses are SSE
// frames; an error after the stream started is delivered as a terminal
// error frame since the status line is already gone.

use crate::api_keys::mask_key;
use crate::auth;
use crate::chat::{ChatOutcome, ChatParams};
use crate::error::AppError;
use crate::models;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

/// Client IP for the audit log, honoring proxies.
pub(super) fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn require_str(body: &Value, field: &str) -> Result<String, AppError> {
    body.get(field)
        .and_then(|v| v.as_str())
        .map(String::from)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation(format!("missing required field: {field}")))
}

fn parse_chat_params(body: &Value) -> Result<ChatParams, AppError> {
    let model = require_str(body, "model")?;
    let messages = body
        .get("messages")
        .and_then(|v| v.as_array())
        .cloned()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| AppError::Validation("messages must be a non-empty array".to_string()))?;

    let mut params = ChatParams::new(model, messages);
    params.stream = body.get("stream").and_then(|v| v.as_bool());
    params.reasoning_effort = body
        .get("reasoning_effort")
        .and_then(|v| v.as_str())
        .map(String::from);
    if let Some(effort) = &params.reasoning_effort {
        const EFFORTS: [&str; 6] = ["none", "minimal", "low", "medium", "high", "xhigh"];
        if !EFFORTS.contains(&effort.as_str()) {
            return Err(AppError::Validation(format!(
                "invalid reasoning_effort: {effort}"
            )));
        }
    }
    if let Some(temperature) = body.get("temperature").and_then(|v| v.as_f64()) {
        params.temperature = temperature;
    }
    if let Some(top_p) = body.get("top_p").and_then(|v| v.as_f64()) {
        params.top_p = top_p;
    }
    params.conversation_id = body
        .get("conversation_id")
        .and_then(|v| v.as_str())
        .map(String::from);
    Ok(params)
}

/// SSE response from a frame stream; mid-stream errors become a terminal
/// error frame.
fn sse_response(frames: crate::chat::FrameStream) -> Response {
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
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let config = state.config_snapshot();
    let identity = match auth::verify_api_key(&config, &state.api_keys, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let params = match parse_chat_params(&body) {
        Ok(params) => params,
        Err(e) => return e.into_response(),
    };

    let start = Instant::now();
    let ip = client_ip(&headers);
    let key_masked = mask_key(&identity);
    let model = params.model.clone();
    let is_stream_request = params.stream.unwrap_or(config.app.stream);

    match state.chat.completions(params).await {
        Ok(ChatOutcome::Stream { frames, .. }) => {
            state.stats.record(&model, true).await;
            state
                .request_log
                .log(
                    &model,
                    200,
                    start.elapsed().as_millis() as u64,
                    &ip,
                    &key_masked,
                    None,
                    true,
                )
                .await;
            sse_response(frames)
        }
        Ok(ChatOutcome::Complete(completion)) => {
            state.stats.record(&model, true).await;
            state
                .request_log
                .log(
                    &model,
                    200,
                    start.elapsed().as_millis() as u64,
                    &ip,
                    &key_masked,
                    None,
                    false,
                )
                .await;
            Json(completion).into_response()
        }
        Err(e) => {
            let status = e.status().as_u16();
            state.stats.record(&model, false).await;
            state
                .request_log
                .log(
                    &model,
                    status,
                    start.elapsed().as_millis() as u64,
                    &ip,
                    &key_masked,
                    Some(&e.to_string()),
                    is_stream_request,
                )
                .await;
            e.into_response()
        }
    }
}

pub async fn models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let config = state.config_snapshot();
    if let Err(e) = auth::verify_api_key(&config, &state.api_keys, &headers).await {
        return e.into_response();
    }
    Json(models::catalog()).into_response()
}

/// Markdown image URLs out of a completion body.
fn extract_image_urls(content: &str) -> Vec<String> {
    let re = regex::Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").expect("static regex");
    re.captures_iter(content)
        .map(|c| c[1].to_string())
        .collect()
}

pub async fn images_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let config = state.config_snapshot();
    let identity = match auth::verify_api_key(&config, &state.api_keys, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let prompt = match require_str(&body, "prompt") {
        Ok(prompt) => prompt,
        Err(e) => return e.into_response(),
    };
    let n = body.get("n").and_then(|v| v.as_u64()).unwrap_or(1).clamp(1, 4) as usize;
    let response_format = body
        .get("response_format")
        .and_then(|v| v.as_str())
        .unwrap_or("url");
    if !matches!(response_format, "url" | "b64_json") {
        return AppError::Validation(format!("invalid response_format: {response_format}"))
            .into_response();
    }

    // Image generation rides the chat pipeline with the image-capable model
    let mut params = ChatParams::new("grok-imagine", vec![json!({"role": "user", "content": prompt})]);
    params.stream = Some(false);
    params.reasoning_effort = Some("none".to_string());

    let start = Instant::now();
    let ip = client_ip(&headers);
    let key_masked = mask_key(&identity);

    let outcome = match state.chat.completions(params).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.stats.record("grok-imagine", false).await;
            state
                .request_log
                .log(
                    "grok-imagine",
                    e.status().as_u16(),
                    start.elapsed().as_millis() as u64,
                    &ip,
                    &key_masked,
                    Some(&e.to_string()),
                    false,
                )
                .await;
            return e.into_response();
        }
    };
    let ChatOutcome::Complete(completion) = outcome else {
        return AppError::Internal(anyhow::anyhow!("image generation returned a stream"))
            .into_response();
    };

    let content = completion["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("");
    let urls: Vec<String> = extract_image_urls(content).into_iter().take(n).collect();
    if urls.is_empty() {
        let e = AppError::Upstream(crate::error::UpstreamError::new(
            502,
            "upstream produced no images",
        ));
        state.stats.record("grok-imagine", false).await;
        return e.into_response();
    }

    let mut data = Vec::new();
    for url in urls {
        if response_format == "b64_json" {
            match fetch_as_base64(&state, &url).await {
                Ok(b64) => data.push(json!({"b64_json": b64})),
                Err(e) => {
                    tracing::warn!("image fetch failed for {url}: {e}");
                    data.push(json!({"url": url}));
                }
            }
        } else {
            data.push(json!({"url": url}));
        }
    }

    state.stats.record("grok-imagine", true).await;
    state
        .request_log
        .log(
            "grok-imagine",
            200,
            start.elapsed().as_millis() as u64,
            &ip,
            &key_masked,
            None,
            false,
        )
        .await;

    Json(json!({
        "created": chrono::Utc::now().timestamp(),
        "data": data,
    }))
    .into_response()
}

/// Download an asset through the asset proxy and base64-encode it.
async fn fetch_as_base64(state: &AppState, url: &str) -> anyhow::Result<String> {
    let proxy = state.proxy_pool.get(true).await;
    let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(60));
    if let Some(proxy) = &proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    let client = builder.build()?;
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    Ok(base64::engine::general_purpose::STANDARD.encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_params_require_model_and_messages() {
        let err = parse_chat_params(&json!({"messages": [{"role":"user","content":"x"}]}));
        assert!(err.is_err());

        let err = parse_chat_params(&json!({"model": "grok-3", "messages": []}));
        assert!(err.is_err());

        let params = parse_chat_params(&json!({
            "model": "grok-3",
            "messages": [{"role": "user", "content": "x"}],
            "stream": true,
            "temperature": 0.3,
            "reasoning_effort": "high",
            "conversation_id": "conv-abc",
        }))
        .unwrap();
        assert_eq!(params.model, "grok-3");
        assert_eq!(params.stream, Some(true));
        assert_eq!(params.temperature, 0.3);
        assert_eq!(params.reasoning_effort.as_deref(), Some("high"));
        assert_eq!(params.conversation_id.as_deref(), Some("conv-abc"));
    }

    #[test]
    fn invalid_reasoning_effort_is_rejected() {
        let err = parse_chat_params(&json!({
            "model": "grok-3",
            "messages": [{"role": "user", "content": "x"}],
            "reasoning_effort": "extreme",
        }));
        assert!(err.is_err());
    }

    #[test]
    fn image_urls_extracted_from_markdown() {
        let content = "before ![a](https://x/1.jpg) mid ![b](https://x/2.jpg) after";
        assert_eq!(
            extract_image_urls(content),
            vec!["https://x/1.jpg", "https://x/2.jpg"]
        );
        assert!(extract_image_urls("no images").is_empty());
    }

    #[test]
    fn forwarded_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.9, 10.0.0.1".parse().unwrap(),
        );
        assert_eq!(client_ip(&headers), "203.0.113.9");
        assert_eq!(client_ip(&HeaderMap::new()), "");
    }
}
