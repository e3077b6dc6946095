// Upstream client - impersonated browser-session requests
//
// Four request shapes against the upstream's private app-chat API: start a
// conversation, continue one, publish a share link, and clone a share link
// under a different token. Chat responses stream back as newline-delimited
// JSON; this client hands out raw lines and never parses their semantics
// (the stream processor owns that), which keeps the processor testable
// against canned line arrays.
//
// Every chat request may rotate the egress proxy on 403: the upstream blocks
// by IP, so a fresh proxy from the pool is often enough to get back in.

use crate::config::{ChatSettings, ProxySettings};
use crate::error::{AppError, UpstreamError};
use crate::proxy_pool::ProxyPool;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

const CHAT_NEW_URL: &str = "https://grok.com/rest/app-chat/conversations/new";

fn continue_url(conversation_id: &str) -> String {
    format!("https://grok.com/rest/app-chat/conversations/{conversation_id}/responses")
}

fn share_url(conversation_id: &str) -> String {
    format!("https://grok.com/rest/app-chat/conversations/{conversation_id}/share")
}

fn clone_url(share_link_id: &str) -> String {
    format!("https://grok.com/rest/app-chat/share_links/{share_link_id}/clone")
}

/// Cap on how much of an upstream error body is kept for classification.
const ERROR_BODY_LIMIT: usize = 4096;

/// Async stream of raw upstream lines.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

/// One chat turn as the upstream expects it.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub message: String,
    /// Upstream model name
    pub model: String,
    pub mode: Option<String>,
    pub file_attachments: Vec<String>,
    pub model_config_override: Option<Value>,
    pub temporary: bool,
    pub disable_memory: bool,
}

/// Seam between the request engine and the upstream protocol. The production
/// implementation is [`AppChatClient`]; tests substitute canned streams.
#[async_trait]
pub trait ChatUpstream: Send + Sync {
    async fn start_chat(&self, token: &str, request: &ChatRequest) -> Result<LineStream, AppError>;

    async fn continue_chat(
        &self,
        token: &str,
        conversation_id: &str,
        parent_response_id: &str,
        request: &ChatRequest,
    ) -> Result<LineStream, AppError>;

    /// Publish a share link for a response. Failures are non-fatal.
    async fn share_conversation(
        &self,
        token: &str,
        conversation_id: &str,
        response_id: &str,
    ) -> Option<String>;

    /// Adopt a shared conversation under a new token. Returns the new
    /// conversation id and the response id to continue from.
    async fn clone_share_link(&self, token: &str, share_link_id: &str)
        -> Option<(String, String)>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads and parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Build the app-chat payload. `parent_response_id` turns it into a
/// continuation of an existing conversation.
pub fn build_payload(request: &ChatRequest, parent_response_id: Option<&str>) -> Value {
    let mut payload = json!({
        "deviceEnvInfo": {
            "darkModeEnabled": false,
            "devicePixelRatio": 2,
            "screenWidth": 2056,
            "screenHeight": 1329,
            "viewportWidth": 2056,
            "viewportHeight": 1083,
        },
        "disableMemory": request.disable_memory,
        "disableSearch": false,
        "disableSelfHarmShortCircuit": false,
        "disableTextFollowUps": false,
        "enableImageGeneration": true,
        "enableImageStreaming": true,
        "enableSideBySide": true,
        "fileAttachments": request.file_attachments,
        "forceConcise": false,
        "forceSideBySide": false,
        "imageAttachments": [],
        "imageGenerationCount": 2,
        "isAsyncChat": false,
        "isReasoning": false,
        "message": request.message,
        "modelMode": request.mode,
        "modelName": request.model,
        "responseMetadata": {
            "requestModelDetails": { "modelId": request.model },
        },
        "returnImageBytes": false,
        "returnRawGrokInXaiRequest": false,
        "sendFinalMetadata": true,
        "temporary": request.temporary,
        "toolOverrides": {},
    });

    if let Some(override_value) = &request.model_config_override {
        payload["responseMetadata"]["modelConfigOverride"] = override_value.clone();
    }
    if let Some(parent) = parent_response_id {
        payload["parentResponseId"] = json!(parent);
    }
    payload
}

/// Pull `shareLinkId` out of a share response.
fn parse_share_response(value: &Value) -> Option<String> {
    value
        .get("shareLinkId")
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Pull the new conversation id and resume point out of a clone response.
/// The resume point is the last assistant response, falling back to the last
/// response of any sender.
fn parse_clone_response(value: &Value) -> Option<(String, String)> {
    let conversation_id = value
        .get("conversation")?
        .get("conversationId")?
        .as_str()?
        .to_string();

    let responses = value
        .get("responses")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();

    let last_response_id = responses
        .iter()
        .rev()
        .find(|r| r.get("sender").and_then(|s| s.as_str()) == Some("assistant"))
        .or_else(|| responses.last())
        .and_then(|r| r.get("responseId"))
        .and_then(|v| v.as_str())
        .map(String::from)?;

    Some((conversation_id, last_response_id))
}

/// Split a byte stream into trimmed lines.
fn lines_from_bytes<S, E>(body: S) -> LineStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        futures::pin_mut!(body);
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| UpstreamError::transport(&e))?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                yield String::from_utf8_lossy(&line).into_owned();
            }
        }
        if !buf.is_empty() {
            yield String::from_utf8_lossy(&buf).into_owned();
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Production client
// ─────────────────────────────────────────────────────────────────────────────

pub struct AppChatClient {
    proxy_pool: Arc<ProxyPool>,
    browser: String,
    request_timeout: Duration,
}

impl AppChatClient {
    pub fn new(
        proxy_pool: Arc<ProxyPool>,
        proxy_settings: &ProxySettings,
        chat_settings: &ChatSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            proxy_pool,
            browser: proxy_settings.browser.clone(),
            request_timeout: Duration::from_secs(chat_settings.request_timeout_sec.max(60)),
        })
    }

    /// Impersonation headers for the configured browser profile, with the
    /// token riding in the session cookies.
    fn headers(&self, token: &str) -> Result<HeaderMap, UpstreamError> {
        // One profile family ships today; unknown profiles fall back to it so
        // a config typo degrades to a stale fingerprint, not a dead gateway.
        let (user_agent, sec_ch_ua) = match self.browser.as_str() {
            "chrome136" => (
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36",
                "\"Chromium\";v=\"136\", \"Google Chrome\";v=\"136\", \"Not.A/Brand\";v=\"99\"",
            ),
            "chrome131" => (
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
                "\"Chromium\";v=\"131\", \"Google Chrome\";v=\"131\", \"Not.A/Brand\";v=\"99\"",
            ),
            _ => (
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36",
                "\"Chromium\";v=\"136\", \"Google Chrome\";v=\"136\", \"Not.A/Brand\";v=\"99\"",
            ),
        };

        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static(user_agent));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert(
            "accept-language",
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("origin", HeaderValue::from_static("https://grok.com"));
        headers.insert("referer", HeaderValue::from_static("https://grok.com/"));
        headers.insert("sec-ch-ua", HeaderValue::from_static(sec_ch_ua));
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"macOS\""));
        headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));

        let cookie = format!("sso={token}; sso-rw={token}");
        headers.insert(
            "cookie",
            HeaderValue::from_str(&cookie)
                .map_err(|_| UpstreamError::new(400, "token contains invalid characters"))?,
        );
        Ok(headers)
    }

    fn build_client(&self, proxy: Option<&str>) -> Result<reqwest::Client, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .gzip(true);
        if let Some(proxy) = proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| UpstreamError::new(502, format!("invalid proxy url: {e}")))?,
            );
        }
        builder
            .build()
            .map_err(|e| UpstreamError::new(502, format!("failed to build http client: {e}")))
    }

    /// POST a chat payload, rotating the egress proxy while the upstream
    /// answers 403, then fail eagerly on any other non-2xx.
    async fn send_chat(
        &self,
        url: &str,
        token: &str,
        payload: &Value,
    ) -> Result<reqwest::Response, AppError> {
        let headers = self.headers(token)?;
        let attempts = self.proxy_pool.rotation_attempts();
        let mut response = None;

        for attempt in 0..attempts {
            let proxy = self.proxy_pool.get(false).await;
            let client = self.build_client(proxy.as_deref())?;
            let sent = client
                .post(url)
                .headers(headers.clone())
                .json(payload)
                .send()
                .await
                .map_err(|e| UpstreamError::transport(&e))?;

            if sent.status().as_u16() == 403 && attempt + 1 < attempts {
                tracing::warn!(
                    "upstream 403, rotating proxy (attempt {}/{attempts})",
                    attempt + 1
                );
                self.proxy_pool.refresh(true).await;
                response = Some(sent);
                continue;
            }
            response = Some(sent);
            break;
        }

        let response = response.expect("at least one attempt was made");
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(ERROR_BODY_LIMIT);
            let code = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("code").and_then(|c| c.as_str()).map(String::from));
            let mut err = UpstreamError::new(status.as_u16(), body);
            if let Some(code) = code {
                err = err.with_code(code);
            }
            tracing::error!("upstream chat request failed: status={status}");
            return Err(err.into());
        }
        Ok(response)
    }

    /// Fire-and-forget style POST used by the share/clone endpoints.
    async fn post_json(&self, url: &str, token: &str, payload: &Value) -> Option<Value> {
        let headers = self.headers(token).ok()?;
        let proxy = self.proxy_pool.get(false).await;
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = &proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).ok()?);
        }
        let client = builder.build().ok()?;
        let response = client
            .post(url)
            .headers(headers)
            .json(payload)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            tracing::debug!("upstream auxiliary request failed: status={}", response.status());
            return None;
        }
        response.json().await.ok()
    }
}

#[async_trait]
impl ChatUpstream for AppChatClient {
    async fn start_chat(&self, token: &str, request: &ChatRequest) -> Result<LineStream, AppError> {
        let payload = build_payload(request, None);
        let response = self.send_chat(CHAT_NEW_URL, token, &payload).await?;
        tracing::info!("chat connected: model={}", request.model);
        Ok(lines_from_bytes(response.bytes_stream()))
    }

    async fn continue_chat(
        &self,
        token: &str,
        conversation_id: &str,
        parent_response_id: &str,
        request: &ChatRequest,
    ) -> Result<LineStream, AppError> {
        let payload = build_payload(request, Some(parent_response_id));
        let response = self
            .send_chat(&continue_url(conversation_id), token, &payload)
            .await?;
        tracing::info!(
            "chat continued: model={} conversation={conversation_id}",
            request.model
        );
        Ok(lines_from_bytes(response.bytes_stream()))
    }

    async fn share_conversation(
        &self,
        token: &str,
        conversation_id: &str,
        response_id: &str,
    ) -> Option<String> {
        if conversation_id.is_empty() || response_id.is_empty() {
            return None;
        }
        let payload = json!({ "responseId": response_id, "allowIndexing": true });
        let value = self
            .post_json(&share_url(conversation_id), token, &payload)
            .await?;
        parse_share_response(&value)
    }

    async fn clone_share_link(
        &self,
        token: &str,
        share_link_id: &str,
    ) -> Option<(String, String)> {
        if share_link_id.is_empty() {
            return None;
        }
        let value = self
            .post_json(&clone_url(share_link_id), token, &json!({}))
            .await?;
        parse_clone_response(&value)
    }
}
