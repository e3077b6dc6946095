// Chat service - per-request supervisor and cross-token retry orchestrator
//
// One request flows: resolve conversation context (explicit id, else history
// auto-match) -> pick a token (context-pinned token first) -> migrate the
// conversation if the token changed (share-link clone, else detach) -> issue
// the upstream call -> process as stream or collected object. Recoverable
// upstream failures (429, non-auth errors) cool the token and rotate to the
// next candidate, bounded by `retry.max_retry`; auth failures surface
// immediately. Quota is consumed and the context updated only after a clean
// close, so a cancelled or broken stream never counts as a turn.

pub mod collect;
pub mod extract;
pub mod stream;
pub mod timeout;

use crate::breaker::CircuitBreaker;
use crate::config::{self, SharedConfig};
use crate::conversation::{self, ContextUpdate, ConversationContext, ConversationStore};
use crate::error::AppError;
use crate::models;
use crate::token::{Effort, TokenManager};
use crate::upstream::{ChatRequest, ChatUpstream};
use collect::CollectProcessor;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use stream::StreamProcessor;
use timeout::StreamTimeouts;
use tokio::sync::Semaphore;

/// Parsed chat-completions request, transport details already stripped.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub model: String,
    pub messages: Vec<Value>,
    pub stream: Option<bool>,
    pub reasoning_effort: Option<String>,
    pub temperature: f64,
    pub top_p: f64,
    pub conversation_id: Option<String>,
}

impl ChatParams {
    pub fn new(model: impl Into<String>, messages: Vec<Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: None,
            reasoning_effort: None,
            temperature: 0.8,
            top_p: 0.95,
            conversation_id: None,
        }
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, AppError>> + Send>>;

pub enum ChatOutcome {
    Stream {
        conversation_id: String,
        frames: FrameStream,
    },
    Complete(Value),
}

impl std::fmt::Debug for ChatOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatOutcome::Stream { conversation_id, .. } => f
                .debug_struct("Stream")
                .field("conversation_id", conversation_id)
                .finish(),
            ChatOutcome::Complete(v) => f.debug_tuple("Complete").field(v).finish(),
        }
    }
}

/// Bounded semaphore around upstream calls. The configured limit is checked
/// on every acquire and the semaphore re-created when it changed.
pub struct ChatGate {
    inner: std::sync::Mutex<(usize, Arc<Semaphore>)>,
}

impl ChatGate {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new((0, Arc::new(Semaphore::new(1)))),
        }
    }

    fn get(&self, configured: usize) -> Arc<Semaphore> {
        let configured = configured.max(1);
        let mut inner = self.inner.lock().expect("chat gate lock poisoned");
        if inner.0 != configured {
            *inner = (configured, Arc::new(Semaphore::new(configured)));
        }
        inner.1.clone()
    }
}

impl Default for ChatGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ChatService {
    config: SharedConfig,
    tokens: Arc<TokenManager>,
    conversations: Arc<ConversationStore>,
    upstream: Arc<dyn ChatUpstream>,
    breaker: Option<Arc<CircuitBreaker>>,
    gate: Arc<ChatGate>,
}

impl ChatService {
    pub fn new(
        config: SharedConfig,
        tokens: Arc<TokenManager>,
        conversations: Arc<ConversationStore>,
        upstream: Arc<dyn ChatUpstream>,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            config,
            tokens,
            conversations,
            upstream,
            breaker,
            gate: Arc::new(ChatGate::new()),
        }
    }

    /// Candidate selection: the context-pinned token first (when it is still
    /// selectable and untried), then the model's pool order. When nothing is
    /// selectable and no token was tried yet, give cooled tokens one chance
    /// to thaw before giving up.
    async fn pick_token(
        &self,
        model_id: &str,
        tried: &HashSet<String>,
        preferred: Option<&str>,
    ) -> Option<String> {
        if let Some(preferred) = preferred {
            if !tried.contains(preferred) {
                if let Some(info) = self.tokens.get(preferred).await {
                    if info.selectable() {
                        return Some(preferred.to_string());
                    }
                }
            }
        }

        for pool in models::pool_candidates(model_id) {
            if let Some(info) = self.tokens.select(pool, tried).await {
                return Some(info.token);
            }
        }

        if tried.is_empty() && self.tokens.refresh_cooling().await > 0 {
            for pool in models::pool_candidates(model_id) {
                if let Some(info) = self.tokens.select(pool, tried).await {
                    return Some(info.token);
                }
            }
        }

        None
    }

    /// Record the finished exchange: update or create the context, then
    /// schedule share-link creation as a detached task. The share link write
    /// never increments the turn count.
    async fn finalize_conversation(
        &self,
        had_context: bool,
        gateway_id: &str,
        token: &str,
        upstream_conversation_id: &str,
        response_id: &str,
        messages: &[Value],
    ) {
        if had_context {
            self.conversations
                .update(
                    gateway_id,
                    ContextUpdate {
                        response_id: response_id.to_string(),
                        messages: Some(messages.to_vec()),
                        conversation_id: Some(upstream_conversation_id.to_string()),
                        token: Some(token.to_string()),
                        increment_message: true,
                        ..Default::default()
                    },
                )
                .await;
        } else {
            self.conversations
                .create(
                    token,
                    upstream_conversation_id,
                    response_id,
                    Some(messages),
                    Some(gateway_id.to_string()),
                )
                .await;
        }

        let upstream = self.upstream.clone();
        let conversations = self.conversations.clone();
        let token = token.to_string();
        let conversation_id = upstream_conversation_id.to_string();
        let response_id = response_id.to_string();
        let gateway_id = gateway_id.to_string();
        tokio::spawn(async move {
            if let Some(share_link) = upstream
                .share_conversation(&token, &conversation_id, &response_id)
                .await
            {
                conversations
                    .attach_share_link(&gateway_id, &share_link)
                    .await;
            }
        });
    }

    /// Chat Completions entry point.
    pub async fn completions(&self, params: ChatParams) -> Result<ChatOutcome, AppError> {
        let config = config::snapshot(&self.config);
        self.tokens.reload_if_stale().await;

        let model_info = models::get(&params.model)
            .ok_or_else(|| AppError::Validation(format!("Unknown model: {}", params.model)))?;

        let show_think = match params.reasoning_effort.as_deref() {
            Some(effort) => effort != "none",
            None => config.app.thinking,
        };
        let is_stream = params.stream.unwrap_or(config.app.stream);

        // Resolve conversation context
        let mut gateway_id = params.conversation_id.clone();
        let mut context: Option<ConversationContext> = None;
        if let Some(id) = &params.conversation_id {
            context = self.conversations.get(id).await;
        }
        if context.is_none() && params.messages.len() > 1 {
            if let Some(matched) = self.conversations.find_by_history(&params.messages).await {
                context = self.conversations.get(&matched).await;
                if context.is_some() {
                    gateway_id = Some(matched);
                }
            }
        }
        let mut gateway_id = gateway_id.unwrap_or_else(conversation::generate_id);

        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<AppError> = None;

        for attempt in 0..config.retry.max_retry {
            let preferred = context.as_ref().map(|c| c.token.clone());
            let Some(token) = self
                .pick_token(&params.model, &tried, preferred.as_deref())
                .await
            else {
                break;
            };
            tried.insert(token.clone());

            // Cross-token migration: clone the shared conversation under the
            // new token, or detach and start fresh.
            if let Some(ctx) = &context {
                if ctx.token != token {
                    let mut migrated = false;
                    if !ctx.share_link_id.is_empty() {
                        if let Some((new_conversation_id, new_response_id)) = self
                            .upstream
                            .clone_share_link(&token, &ctx.share_link_id)
                            .await
                        {
                            self.conversations
                                .update(
                                    &gateway_id,
                                    ContextUpdate {
                                        response_id: new_response_id,
                                        conversation_id: Some(new_conversation_id),
                                        token: Some(token.clone()),
                                        share_link_id: Some(ctx.share_link_id.clone()),
                                        increment_message: false,
                                        ..Default::default()
                                    },
                                )
                                .await;
                            context = self.conversations.get(&gateway_id).await;
                            migrated = context.is_some();
                            if migrated {
                                tracing::info!(
                                    "conversation {gateway_id} migrated to a new token via share link"
                                );
                            }
                        }
                    }
                    if !migrated {
                        context = None;
                        gateway_id = conversation::generate_id();
                        tracing::debug!(
                            "conversation detached on token switch; new id {gateway_id}"
                        );
                    }
                }
            }

            let is_continue = context.is_some();
            let extracted = extract::extract(&params.messages, is_continue);
            if !extracted.file_attachments.is_empty() || !extracted.image_attachments.is_empty() {
                tracing::warn!(
                    "dropping {} attachments: uploads are not supported",
                    extracted.file_attachments.len() + extracted.image_attachments.len()
                );
            }

            let mut model_config_override = json!({
                "temperature": params.temperature,
                "topP": params.top_p,
            });
            if let Some(effort) = &params.reasoning_effort {
                model_config_override["reasoningEffort"] = json!(effort);
            }

            let request = ChatRequest {
                message: extracted.text,
                model: model_info.upstream_model.to_string(),
                mode: model_info.mode.map(String::from),
                file_attachments: Vec::new(),
                model_config_override: Some(model_config_override),
                temporary: config.app.temporary,
                disable_memory: config.app.disable_memory,
            };

            // The permit is held until the response is fully processed
            let semaphore = self.gate.get(config.chat.concurrent);
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| AppError::Internal(anyhow::anyhow!("chat gate closed")))?;

            let connect = || async {
                match &context {
                    Some(ctx) => {
                        self.upstream
                            .continue_chat(
                                &token,
                                &ctx.conversation_id,
                                &ctx.last_response_id,
                                &request,
                            )
                            .await
                    }
                    None => self.upstream.start_chat(&token, &request).await,
                }
            };
            let connected = match &self.breaker {
                Some(breaker) => breaker.call(connect).await,
                None => connect().await,
            };

            let lines = match connected {
                Ok(lines) => lines,
                Err(AppError::Upstream(e)) => {
                    if e.is_rate_limited() {
                        let has_quota = e.has_quota();
                        self.tokens
                            .apply_cooldown(&token, 429, has_quota, "rate_limit")
                            .await;
                        tracing::warn!(
                            "token rate limited, rotating (attempt {}/{})",
                            attempt + 1,
                            config.retry.max_retry
                        );
                        last_error = Some(e.into());
                        continue;
                    }
                    if e.status == 401 || e.status == 403 {
                        self.tokens
                            .record_failure(&token, e.status, "chat_auth_failed")
                            .await;
                        return Err(e.into());
                    }
                    self.tokens
                        .apply_cooldown(&token, e.status, None, &format!("status_{}", e.status))
                        .await;
                    tracing::warn!(
                        "upstream status {}, rotating token (attempt {}/{})",
                        e.status,
                        attempt + 1,
                        config.retry.max_retry
                    );
                    last_error = Some(e.into());
                    continue;
                }
                Err(other) => return Err(other),
            };

            let timeouts = StreamTimeouts {
                first: config.chat.stream_first_timeout,
                idle: config.chat.stream_idle_timeout,
                total: config.chat.stream_total_timeout,
            };
            let supervised = timeout::with_stream_timeouts(lines, timeouts);
            let effort = model_info.cost;
            let prior_conversation_id = context.as_ref().map(|c| c.conversation_id.clone());

            if is_stream {
                let processor = StreamProcessor::new(
                    params.model.clone(),
                    Some(gateway_id.clone()),
                    show_think,
                    config.app.filter_tags.clone(),
                );
                let (outcome, frames) = processor.process(supervised);
                let wrapped = self.clone().finish_stream(
                    frames,
                    outcome,
                    permit,
                    token,
                    effort,
                    gateway_id.clone(),
                    is_continue,
                    prior_conversation_id,
                    params.messages.clone(),
                );
                return Ok(ChatOutcome::Stream {
                    conversation_id: gateway_id,
                    frames: Box::pin(wrapped),
                });
            }

            let collector =
                CollectProcessor::new(params.model.clone(), config.app.filter_tags.clone());
            let collected = collector.process(supervised).await;
            drop(permit);

            self.tokens.consume(&token, effort).await;
            tracing::info!(
                "chat completed: model={} effort={}",
                params.model,
                effort.as_str()
            );

            let upstream_conversation_id =
                collected.conversation_id.clone().or(prior_conversation_id);
            if let (Some(conversation_id), Some(response_id)) =
                (upstream_conversation_id, collected.response_id.clone())
            {
                self.finalize_conversation(
                    is_continue,
                    &gateway_id,
                    &token,
                    &conversation_id,
                    &response_id,
                    &params.messages,
                )
                .await;
            }

            let mut completion = collected.completion;
            completion["conversation_id"] = json!(gateway_id);
            return Ok(ChatOutcome::Complete(completion));
        }

        Err(last_error.unwrap_or(AppError::TokensExhausted))
    }

    /// Wrap a frame stream so bookkeeping runs only after a clean close:
    /// consume quota, update the context, schedule the share link. A client
    /// disconnect drops the stream before the tail runs, skipping all of it.
    #[allow(clippy::too_many_arguments)]
    fn finish_stream(
        self,
        frames: impl Stream<Item = Result<String, AppError>> + Send + 'static,
        outcome: stream::SharedOutcome,
        permit: tokio::sync::OwnedSemaphorePermit,
        token: String,
        effort: Effort,
        gateway_id: String,
        had_context: bool,
        prior_conversation_id: Option<String>,
        messages: Vec<Value>,
    ) -> impl Stream<Item = Result<String, AppError>> + Send {
        async_stream::stream! {
            let _permit = permit;
            futures::pin_mut!(frames);

            let mut clean = true;
            while let Some(item) = frames.next().await {
                let failed = item.is_err();
                yield item;
                if failed {
                    clean = false;
                    break;
                }
            }

            if clean {
                self.tokens.consume(&token, effort).await;
                let captured = outcome.lock().expect("outcome lock poisoned").clone();
                let upstream_conversation_id =
                    captured.conversation_id.or(prior_conversation_id);
                if let (Some(conversation_id), Some(response_id)) =
                    (upstream_conversation_id, captured.response_id)
                {
                    self.finalize_conversation(
                        had_context,
                        &gateway_id,
                        &token,
                        &conversation_id,
                        &response_id,
                        &messages,
                    )
                    .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TokenSettings};
    use crate::error::UpstreamError;
    use crate::storage::LocalStorage;
    use crate::upstream::LineStream;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        New { token: String },
        Continue {
            token: String,
            conversation_id: String,
            parent_response_id: String,
        },
        Clone { token: String, share_link_id: String },
    }

    enum Scripted {
        Lines(Vec<String>),
        LinesThenError(Vec<String>, UpstreamError),
        Fail(UpstreamError),
    }

    struct MockUpstream {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<Call>>,
        clone_result: Mutex<Option<(String, String)>>,
    }

    impl MockUpstream {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                clone_result: Mutex::new(None),
            })
        }

        fn push_lines(&self, lines: &[&str]) {
            self.script
                .lock()
                .unwrap()
                .push_back(Scripted::Lines(lines.iter().map(|l| l.to_string()).collect()));
        }

        fn push_failure(&self, error: UpstreamError) {
            self.script.lock().unwrap().push_back(Scripted::Fail(error));
        }

        fn set_clone_result(&self, result: Option<(String, String)>) {
            *self.clone_result.lock().unwrap() = result;
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn chat_attempts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| !matches!(c, Call::Clone { .. }))
                .count()
        }

        fn next_scripted(&self) -> Result<LineStream, AppError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Scripted::Lines(lines)) => {
                    let items: Vec<Result<String, UpstreamError>> =
                        lines.into_iter().map(Ok).collect();
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Some(Scripted::LinesThenError(lines, error)) => {
                    let mut items: Vec<Result<String, UpstreamError>> =
                        lines.into_iter().map(Ok).collect();
                    items.push(Err(error));
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Some(Scripted::Fail(error)) => Err(error.into()),
                None => panic!("mock upstream exhausted"),
            }
        }
    }

    #[async_trait]
    impl ChatUpstream for MockUpstream {
        async fn start_chat(
            &self,
            token: &str,
            _request: &ChatRequest,
        ) -> Result<LineStream, AppError> {
            self.calls.lock().unwrap().push(Call::New {
                token: token.to_string(),
            });
            self.next_scripted()
        }

        async fn continue_chat(
            &self,
            token: &str,
            conversation_id: &str,
            parent_response_id: &str,
            _request: &ChatRequest,
        ) -> Result<LineStream, AppError> {
            self.calls.lock().unwrap().push(Call::Continue {
                token: token.to_string(),
                conversation_id: conversation_id.to_string(),
                parent_response_id: parent_response_id.to_string(),
            });
            self.next_scripted()
        }

        async fn share_conversation(
            &self,
            _token: &str,
            _conversation_id: &str,
            _response_id: &str,
        ) -> Option<String> {
            None
        }

        async fn clone_share_link(
            &self,
            token: &str,
            share_link_id: &str,
        ) -> Option<(String, String)> {
            self.calls.lock().unwrap().push(Call::Clone {
                token: token.to_string(),
                share_link_id: share_link_id.to_string(),
            });
            self.clone_result.lock().unwrap().clone()
        }
    }

    struct Harness {
        service: ChatService,
        tokens: Arc<TokenManager>,
        conversations: Arc<ConversationStore>,
        upstream: Arc<MockUpstream>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()).unwrap());
        let tokens = TokenManager::new(storage.clone(), TokenSettings::default());
        let conversations =
            ConversationStore::new(storage, crate::config::ConversationSettings::default());
        let upstream = MockUpstream::new();
        let service = ChatService::new(
            config::shared(Config::default()),
            tokens.clone(),
            conversations.clone(),
            upstream.clone(),
            None,
        );
        Harness {
            service,
            tokens,
            conversations,
            upstream,
            _dir: dir,
        }
    }

    const HAPPY_LINES: [&str; 2] = [
        r#"{"result":{"conversation":{"conversationId":"C1"},"response":{"responseId":"R1","token":"pong"}}}"#,
        r#"{"result":{"response":{"modelResponse":{"responseId":"R1","message":"pong"}}}}"#,
    ];

    fn user_msg(text: &str) -> Value {
        json!({"role": "user", "content": text})
    }

    async fn drain_stream(outcome: ChatOutcome) -> (String, Vec<String>) {
        match outcome {
            ChatOutcome::Stream {
                conversation_id,
                mut frames,
            } => {
                let mut collected = Vec::new();
                while let Some(frame) = frames.next().await {
                    collected.push(frame.expect("unexpected stream error"));
                }
                (conversation_id, collected)
            }
            ChatOutcome::Complete(_) => panic!("expected a stream"),
        }
    }

    #[tokio::test]
    async fn stream_happy_path_consumes_quota_and_creates_context() {
        let h = harness();
        h.tokens.add("ssoBasic", "T1").await;
        h.tokens.force_quota("T1", 10).await;
        h.upstream.push_lines(&HAPPY_LINES);

        let mut params = ChatParams::new("grok-3", vec![user_msg("ping")]);
        params.stream = Some(true);
        let outcome = h.service.completions(params).await.unwrap();
        let (conversation_id, frames) = drain_stream(outcome).await;

        // Framing: role chunk, delta, stop, [DONE]
        assert!(frames[0].contains("\"role\":\"assistant\""));
        assert!(frames.iter().any(|f| f.contains("pong")));
        assert!(frames.iter().any(|f| f.contains("\"finish_reason\":\"stop\"")));
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");

        // Quota burned at effort low
        assert_eq!(h.tokens.get("T1").await.unwrap().quota, 9);

        // Context created and pinned
        let context = h.conversations.get(&conversation_id).await.unwrap();
        assert_eq!(context.token, "T1");
        assert_eq!(context.conversation_id, "C1");
        assert_eq!(context.last_response_id, "R1");
        assert_eq!(context.message_count, 1);
    }

    #[tokio::test]
    async fn non_stream_returns_completion_object() {
        let h = harness();
        h.tokens.add("ssoBasic", "T1").await;
        h.tokens.force_quota("T1", 10).await;
        h.upstream.push_lines(&HAPPY_LINES);

        let mut params = ChatParams::new("grok-3", vec![user_msg("ping")]);
        params.stream = Some(false);
        let outcome = h.service.completions(params).await.unwrap();

        let ChatOutcome::Complete(completion) = outcome else {
            panic!("expected a completion object");
        };
        assert_eq!(completion["choices"][0]["message"]["content"], "pong");
        assert!(completion["conversation_id"]
            .as_str()
            .unwrap()
            .starts_with("conv-"));
        assert_eq!(h.tokens.get("T1").await.unwrap().quota, 9);
    }

    #[tokio::test]
    async fn rotates_to_next_token_on_429_with_quota() {
        let h = harness();
        h.tokens.add("ssoBasic", "T1").await;
        h.tokens.add("ssoBasic", "T2").await;
        // T1 has the larger quota so it is deterministically tried first
        h.tokens.force_quota("T1", 20).await;
        h.tokens.force_quota("T2", 10).await;

        h.upstream
            .push_failure(UpstreamError::new(429, r#"{"remainingTokens":5}"#));
        h.upstream.push_lines(&HAPPY_LINES);

        let mut params = ChatParams::new("grok-3", vec![user_msg("ping")]);
        params.stream = Some(false);
        let outcome = h.service.completions(params).await.unwrap();
        assert!(matches!(outcome, ChatOutcome::Complete(_)));

        // T1 cooled with the short (has-quota) window
        let t1 = h.tokens.get("T1").await.unwrap();
        assert_eq!(t1.status, crate::token::TokenStatus::Cooling);
        let expected = TokenSettings::default().cooldown_429_quota_sec;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        assert!((t1.cooldown_until - (now + expected as f64)).abs() < 10.0);

        // T2 served the request
        assert_eq!(h.tokens.get("T2").await.unwrap().quota, 9);
        assert_eq!(h.upstream.chat_attempts(), 2);
    }

    #[tokio::test]
    async fn auth_failure_surfaces_without_retry() {
        let h = harness();
        h.tokens.add("ssoBasic", "T1").await;
        h.tokens.add("ssoBasic", "T2").await;
        h.upstream.push_failure(UpstreamError::new(401, ""));

        let mut params = ChatParams::new("grok-3", vec![user_msg("ping")]);
        params.stream = Some(false);
        let err = h.service.completions(params).await.unwrap_err();

        assert!(matches!(err, AppError::Upstream(ref e) if e.status == 401));
        assert_eq!(h.upstream.chat_attempts(), 1);

        // The failing token left rotation
        let failed = h.upstream.calls().into_iter().find_map(|c| match c {
            Call::New { token } => Some(token),
            _ => None,
        });
        let failed_info = h.tokens.get(&failed.unwrap()).await.unwrap();
        assert_eq!(failed_info.status, crate::token::TokenStatus::Expired);
    }

    #[tokio::test]
    async fn retry_bound_caps_upstream_attempts() {
        let h = harness();
        for i in 0..5 {
            h.tokens.add("ssoBasic", &format!("T{i}")).await;
            h.tokens.force_quota(&format!("T{i}"), 10).await;
        }
        for _ in 0..5 {
            h.upstream
                .push_failure(UpstreamError::new(429, r#"{"remainingTokens":0}"#));
        }

        let mut params = ChatParams::new("grok-3", vec![user_msg("ping")]);
        params.stream = Some(false);
        let err = h.service.completions(params).await.unwrap_err();

        assert_eq!(err.status().as_u16(), 429);
        assert_eq!(h.upstream.chat_attempts(), 3); // retry.max_retry
    }

    #[tokio::test]
    async fn exhausted_pools_yield_rate_limit_error() {
        let h = harness();
        let mut params = ChatParams::new("grok-3", vec![user_msg("ping")]);
        params.stream = Some(false);
        let err = h.service.completions(params).await.unwrap_err();
        assert!(matches!(err, AppError::TokensExhausted));
        assert_eq!(h.upstream.chat_attempts(), 0);
    }

    #[tokio::test]
    async fn migrates_via_share_link_when_pinned_token_is_exhausted() {
        let h = harness();
        h.tokens.add("ssoBasic", "T1").await;
        h.tokens.add("ssoBasic", "T2").await;
        h.tokens.force_quota("T1", 0).await; // pinned token drained
        h.tokens.force_quota("T2", 10).await;

        // Existing context pinned to T1 with a share link
        let gateway_id = h
            .conversations
            .create("T1", "C1", "R1", None, None)
            .await;
        h.conversations.attach_share_link(&gateway_id, "S1").await;

        h.upstream
            .set_clone_result(Some(("C2".to_string(), "R2b".to_string())));
        h.upstream.push_lines(&[
            r#"{"result":{"conversation":{"conversationId":"C2"},"response":{"responseId":"R3","token":"ok"}}}"#,
            r#"{"result":{"response":{"modelResponse":{"responseId":"R3","message":"ok"}}}}"#,
        ]);

        let mut params = ChatParams::new("grok-3", vec![user_msg("next")]);
        params.stream = Some(false);
        params.conversation_id = Some(gateway_id.clone());
        h.service.completions(params).await.unwrap();

        // Clone ran on the new token against the share link
        let calls = h.upstream.calls();
        assert!(calls.contains(&Call::Clone {
            token: "T2".to_string(),
            share_link_id: "S1".to_string(),
        }));
        // The chat continued from the cloned conversation and response
        assert!(calls.contains(&Call::Continue {
            token: "T2".to_string(),
            conversation_id: "C2".to_string(),
            parent_response_id: "R2b".to_string(),
        }));

        // Context rebound: the migration itself added no turn, the
        // completed exchange added one
        let context = h.conversations.get(&gateway_id).await.unwrap();
        assert_eq!(context.token, "T2");
        assert_eq!(context.conversation_id, "C2");
        assert_eq!(context.message_count, 2);
    }

    #[tokio::test]
    async fn detaches_when_clone_fails() {
        let h = harness();
        h.tokens.add("ssoBasic", "T1").await;
        h.tokens.add("ssoBasic", "T2").await;
        h.tokens.force_quota("T1", 0).await;
        h.tokens.force_quota("T2", 10).await;

        let gateway_id = h
            .conversations
            .create("T1", "C1", "R1", None, None)
            .await;
        h.conversations.attach_share_link(&gateway_id, "S1").await;
        h.upstream.set_clone_result(None);
        h.upstream.push_lines(&HAPPY_LINES);

        let mut params = ChatParams::new("grok-3", vec![user_msg("next")]);
        params.stream = Some(false);
        params.conversation_id = Some(gateway_id.clone());
        let outcome = h.service.completions(params).await.unwrap();

        // The request started a fresh conversation under a new gateway id
        let ChatOutcome::Complete(completion) = outcome else {
            panic!("expected completion");
        };
        let new_id = completion["conversation_id"].as_str().unwrap();
        assert_ne!(new_id, gateway_id);
        assert!(h
            .upstream
            .calls()
            .iter()
            .any(|c| matches!(c, Call::New { token } if token == "T2")));
    }

    #[tokio::test]
    async fn auto_resume_continues_from_matched_context() {
        let h = harness();
        h.tokens.add("ssoBasic", "T1").await;
        h.tokens.force_quota("T1", 10).await;

        let history = vec![
            json!({"role": "system", "content": "S"}),
            json!({"role": "user", "content": "U1"}),
        ];
        h.conversations
            .create("T1", "C1", "R1", Some(&history), None)
            .await;

        h.upstream.push_lines(&[
            r#"{"result":{"conversation":{"conversationId":"C1"},"response":{"responseId":"R2","token":"more"}}}"#,
            r#"{"result":{"response":{"modelResponse":{"responseId":"R2","message":"more"}}}}"#,
        ]);

        // Same history plus the answered turn and a new question, no
        // explicit conversation id
        let messages = vec![
            json!({"role": "system", "content": "S"}),
            json!({"role": "user", "content": "U1"}),
            json!({"role": "assistant", "content": "A1"}),
            json!({"role": "user", "content": "U2"}),
        ];
        let mut params = ChatParams::new("grok-3", messages);
        params.stream = Some(false);
        h.service.completions(params).await.unwrap();

        let calls = h.upstream.calls();
        assert!(calls.contains(&Call::Continue {
            token: "T1".to_string(),
            conversation_id: "C1".to_string(),
            parent_response_id: "R1".to_string(),
        }));
    }

    #[tokio::test]
    async fn broken_stream_skips_quota_and_context_bookkeeping() {
        let h = harness();
        h.tokens.add("ssoBasic", "T1").await;
        h.tokens.force_quota("T1", 10).await;

        h.upstream
            .script
            .lock()
            .unwrap()
            .push_back(Scripted::LinesThenError(
                vec![
                    r#"{"result":{"conversation":{"conversationId":"C1"},"response":{"responseId":"R1","token":"par"}}}"#
                        .to_string(),
                ],
                UpstreamError::transport(&"HTTP/2 stream reset"),
            ));

        let mut params = ChatParams::new("grok-3", vec![user_msg("ping")]);
        params.stream = Some(true);
        let outcome = h.service.completions(params).await.unwrap();

        let ChatOutcome::Stream { mut frames, .. } = outcome else {
            panic!("expected a stream");
        };
        let mut saw_error = false;
        while let Some(item) = frames.next().await {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);

        // No clean close: quota untouched, no context recorded
        assert_eq!(h.tokens.get("T1").await.unwrap().quota, 10);
        assert!(h.conversations.list().await.is_empty());
    }

    #[tokio::test]
    async fn chat_gate_recreates_on_limit_change() {
        let gate = ChatGate::new();
        let first = gate.get(10);
        let same = gate.get(10);
        assert!(Arc::ptr_eq(&first, &same));
        let changed = gate.get(5);
        assert!(!Arc::ptr_eq(&first, &changed));
        assert_eq!(changed.available_permits(), 5);
    }
}
