// Streaming response processor
//
// Consumes the upstream's newline-delimited JSON and emits OpenAI delta
// frames. Responsibilities per line:
// - capture response/conversation ids and the model hash (either location;
//   the later sighting wins),
// - wrap reasoning output and image-generation progress in <think> markers,
// - render terminal image URLs and card attachments as markdown,
// - run text deltas through the tag filter chain, buffering tool-usage cards
//   across chunk boundaries and replacing them with one label line.
//
// Framing invariant: exactly one role chunk first, one finish_reason:"stop"
// chunk at the end, then `data: [DONE]`. Think markers always balance.

use crate::error::AppError;
use futures::{Stream, StreamExt};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, OnceLock};

/// Base for relative asset paths in upstream image URLs.
const UPSTREAM_ASSETS: &str = "https://assets.grok.com";

fn tool_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<xai:tool_name>(.*?)</xai:tool_name>").unwrap())
}

fn tool_args_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<xai:tool_args>(.*?)</xai:tool_args>").unwrap())
}

fn cdata_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").unwrap())
}

fn any_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").unwrap())
}

/// Strip optional `data:` prefixes and sentinel lines.
pub fn normalize_line(line: &str) -> Option<&str> {
    let mut text = line.trim();
    if let Some(stripped) = text.strip_prefix("data:") {
        text = stripped.trim();
    }
    if text.is_empty() || text == "[DONE]" {
        return None;
    }
    Some(text)
}

/// Recursively collect image URLs under the known keys, deduplicated in
/// first-seen order.
pub fn collect_image_urls(value: &Value) -> Vec<String> {
    fn walk(value: &Value, urls: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, item) in map {
                    if matches!(key.as_str(), "generatedImageUrls" | "imageUrls" | "imageURLs") {
                        match item {
                            Value::Array(items) => {
                                for url in items {
                                    if let Some(url) = url.as_str() {
                                        if !url.is_empty() && !urls.iter().any(|u| u == url) {
                                            urls.push(url.to_string());
                                        }
                                    }
                                }
                            }
                            Value::String(url) if !url.is_empty() => {
                                if !urls.iter().any(|u| u == url) {
                                    urls.push(url.clone());
                                }
                            }
                            _ => {}
                        }
                    } else {
                        walk(item, urls);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, urls);
                }
            }
            _ => {}
        }
    }
    let mut urls = Vec::new();
    walk(value, &mut urls);
    urls
}

/// Markdown image pointing at the asset host; relative paths are joined.
pub fn render_image_markdown(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        format!("![image]({url})")
    } else {
        format!("![image]({UPSTREAM_ASSETS}/{})", url.trim_start_matches('/'))
    }
}

/// Turn one complete `<xai:tool_usage_card>` span into a label line.
pub fn extract_tool_text(raw: &str, rollout_id: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let strip_cdata = |s: &str| cdata_re().replace_all(s, "$1").trim().to_string();

    let name = tool_name_re()
        .captures(raw)
        .map(|c| strip_cdata(&c[1]))
        .unwrap_or_default();
    let args = tool_args_re()
        .captures(raw)
        .map(|c| strip_cdata(&c[1]))
        .unwrap_or_default();

    let payload: Option<Value> = if args.is_empty() {
        None
    } else {
        serde_json::from_str(&args).ok()
    };
    let arg = |keys: &[&str]| -> String {
        payload
            .as_ref()
            .and_then(|p| {
                keys.iter()
                    .find_map(|k| p.get(k).and_then(|v| v.as_str()).filter(|s| !s.is_empty()))
            })
            .unwrap_or_default()
            .to_string()
    };

    let prefix = if rollout_id.is_empty() {
        String::new()
    } else {
        format!("[{rollout_id}]")
    };

    let (label, text) = match name.as_str() {
        "web_search" => (format!("{prefix}[WebSearch]"), arg(&["query", "q"])),
        "search_images" => (
            format!("{prefix}[SearchImage]"),
            arg(&["image_description", "description", "query"]),
        ),
        "chatroom_send" => (format!("{prefix}[AgentThink]"), arg(&["message"])),
        _ => (name.clone(), args.clone()),
    };

    if !label.is_empty() && !text.is_empty() {
        format!("{label} {text}").trim().to_string()
    } else if !label.is_empty() {
        label
    } else if !text.is_empty() {
        text
    } else {
        // Last resort: strip tags and keep any bare text
        any_tag_re().replace_all(raw, "").trim().to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token filter chain
// ─────────────────────────────────────────────────────────────────────────────

const TOOL_CARD_TAG: &str = "xai:tool_usage_card";
const TOOL_CARD_START: &str = "<xai:tool_usage_card";
const TOOL_CARD_END: &str = "</xai:tool_usage_card>";

/// Per-stream filter over text deltas. Tool-usage cards are buffered across
/// chunks; any other configured tag drops the chunk that carries it.
///
/// `at_line_start` tracks whether the last emitted character was a newline,
/// across chunk boundaries, so a label that follows earlier text always
/// lands on its own line.
#[derive(Debug)]
pub struct TokenFilter {
    filter_tags: Vec<String>,
    tool_usage_enabled: bool,
    tool_open: bool,
    tool_buffer: String,
    at_line_start: bool,
}

impl TokenFilter {
    pub fn new(filter_tags: Vec<String>) -> Self {
        let tool_usage_enabled = filter_tags.iter().any(|t| t == TOOL_CARD_TAG);
        Self {
            filter_tags,
            tool_usage_enabled,
            tool_open: false,
            tool_buffer: String::new(),
            at_line_start: true,
        }
    }

    /// Whether a card span is currently buffering across chunks.
    pub fn buffering(&self) -> bool {
        self.tool_open
    }

    fn filter_tool_card(&mut self, token: &str, rollout_id: &str) -> String {
        let mut output: Vec<String> = Vec::new();
        let mut rest = token;
        let carried_line_start = self.at_line_start;

        let push_label = |output: &mut Vec<String>, line: String| {
            if line.is_empty() {
                return;
            }
            if let Some(last) = output.last_mut() {
                if !last.ends_with('\n') {
                    last.push('\n');
                }
            } else if !carried_line_start {
                output.push("\n".to_string());
            }
            output.push(format!("{line}\n"));
        };

        while !rest.is_empty() {
            if self.tool_open {
                let Some(end_idx) = rest.find(TOOL_CARD_END) else {
                    self.tool_buffer.push_str(rest);
                    return output.concat();
                };
                let end_pos = end_idx + TOOL_CARD_END.len();
                self.tool_buffer.push_str(&rest[..end_pos]);
                let line = extract_tool_text(&self.tool_buffer, rollout_id);
                push_label(&mut output, line);
                self.tool_buffer.clear();
                self.tool_open = false;
                rest = &rest[end_pos..];
                continue;
            }

            let Some(start_idx) = rest.find(TOOL_CARD_START) else {
                output.push(rest.to_string());
                break;
            };
            if start_idx > 0 {
                output.push(rest[..start_idx].to_string());
            }
            match rest[start_idx..].find(TOOL_CARD_END) {
                None => {
                    self.tool_open = true;
                    self.tool_buffer = rest[start_idx..].to_string();
                    break;
                }
                Some(rel_end) => {
                    let end_pos = start_idx + rel_end + TOOL_CARD_END.len();
                    let line = extract_tool_text(&rest[start_idx..end_pos], rollout_id);
                    push_label(&mut output, line);
                    rest = &rest[end_pos..];
                }
            }
        }

        output.concat()
    }

    /// Apply the whole chain to one text delta.
    pub fn filter_token(&mut self, token: &str, rollout_id: &str) -> String {
        if token.is_empty() {
            return String::new();
        }

        let mut token = token.to_string();
        if self.tool_usage_enabled {
            token = self.filter_tool_card(&token, rollout_id);
            if token.is_empty() {
                return String::new();
            }
        }

        for tag in &self.filter_tags {
            if tag == TOOL_CARD_TAG {
                continue;
            }
            if token.contains(&format!("<{tag}")) || token.contains(&format!("</{tag}")) {
                return String::new();
            }
        }

        if !token.is_empty() {
            self.at_line_start = token.ends_with('\n');
        }
        token
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream processor
// ─────────────────────────────────────────────────────────────────────────────

/// Ids captured while a stream runs, read by the supervisor after the stream
/// closes to update conversation state.
#[derive(Debug, Default, Clone)]
pub struct StreamOutcome {
    pub response_id: Option<String>,
    pub conversation_id: Option<String>,
}

pub type SharedOutcome = Arc<Mutex<StreamOutcome>>;

pub struct StreamProcessor {
    model: String,
    /// Gateway conversation id echoed into every chunk
    gateway_conversation_id: Option<String>,
    show_think: bool,
    filter: TokenFilter,
    created: i64,
    fallback_id: String,
    // per-stream capture state
    response_id: Option<String>,
    fingerprint: String,
    rollout_id: String,
    think_opened: bool,
    image_think_active: bool,
    role_sent: bool,
}

impl StreamProcessor {
    pub fn new(
        model: impl Into<String>,
        gateway_conversation_id: Option<String>,
        show_think: bool,
        filter_tags: Vec<String>,
    ) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            model: model.into(),
            gateway_conversation_id,
            show_think,
            filter: TokenFilter::new(filter_tags),
            created: chrono::Utc::now().timestamp(),
            fallback_id: format!("chatcmpl-{}", &hex[..24]),
            response_id: None,
            fingerprint: String::new(),
            rollout_id: String::new(),
            think_opened: false,
            image_think_active: false,
            role_sent: false,
        }
    }

    fn chunk(&self, delta: Value, finish: Option<&str>) -> String {
        let mut chunk = json!({
            "id": self.response_id.clone().unwrap_or_else(|| self.fallback_id.clone()),
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "system_fingerprint": self.fingerprint,
            "choices": [{
                "index": 0,
                "delta": delta,
                "logprobs": null,
                "finish_reason": finish,
            }],
        });
        if let Some(conversation_id) = &self.gateway_conversation_id {
            chunk["conversation_id"] = json!(conversation_id);
        }
        format!("data: {chunk}\n\n")
    }

    fn sse_role(&self) -> String {
        self.chunk(json!({"role": "assistant", "content": ""}), None)
    }

    fn sse_content(&self, content: &str) -> String {
        self.chunk(json!({"content": content}), None)
    }

    fn sse_finish(&self) -> String {
        self.chunk(json!({}), Some("stop"))
    }

    /// Run the processor over a line stream. Returns the shared capture state
    /// and the frame stream; every Ok item is a complete SSE frame.
    pub fn process<S>(
        mut self,
        lines: S,
    ) -> (
        SharedOutcome,
        impl Stream<Item = Result<String, AppError>> + Send,
    )
    where
        S: Stream<Item = Result<String, AppError>> + Send + 'static,
    {
        let outcome: SharedOutcome = Arc::new(Mutex::new(StreamOutcome::default()));
        let shared = outcome.clone();

        let frames = async_stream::stream! {
            futures::pin_mut!(lines);

            while let Some(item) = lines.next().await {
                let line = match item {
                    Ok(line) => line,
                    Err(e) => {
                        // The HTTP layer renders this as a terminal error frame
                        yield Err(e);
                        return;
                    }
                };
                let Some(line) = normalize_line(&line) else { continue };
                let Ok(data) = serde_json::from_str::<Value>(line) else { continue };

                let result = data.get("result").cloned().unwrap_or(Value::Null);
                let resp = result.get("response").cloned().unwrap_or(Value::Null);
                let is_thinking = resp
                    .get("isThinking")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                if self.fingerprint.is_empty() {
                    if let Some(hash) = resp
                        .get("llmInfo")
                        .and_then(|l| l.get("modelHash"))
                        .and_then(|v| v.as_str())
                    {
                        self.fingerprint = hash.to_string();
                    }
                }
                if let Some(rid) = resp.get("responseId").and_then(|v| v.as_str()) {
                    self.response_id = Some(rid.to_string());
                    shared.lock().unwrap().response_id = Some(rid.to_string());
                }
                if let Some(rid) = resp
                    .get("modelResponse")
                    .and_then(|mr| mr.get("responseId"))
                    .and_then(|v| v.as_str())
                {
                    self.response_id = Some(rid.to_string());
                    shared.lock().unwrap().response_id = Some(rid.to_string());
                }
                if let Some(rollout) = resp.get("rolloutId") {
                    self.rollout_id = match rollout {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                }
                if let Some(conversation_id) = result
                    .get("conversation")
                    .and_then(|c| c.get("conversationId"))
                    .and_then(|v| v.as_str())
                {
                    shared.lock().unwrap().conversation_id = Some(conversation_id.to_string());
                }

                if !self.role_sent {
                    self.role_sent = true;
                    yield Ok(self.sse_role());
                }

                // Image generation progress streams inside think markers
                if let Some(progress) = resp.get("streamingImageGenerationResponse") {
                    if !self.show_think {
                        continue;
                    }
                    self.image_think_active = true;
                    if !self.think_opened {
                        self.think_opened = true;
                        yield Ok(self.sse_content("<think>\n"));
                    }
                    let index = progress
                        .get("imageIndex")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                        + 1;
                    let percent = progress
                        .get("progress")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    yield Ok(self.sse_content(&format!(
                        "Generating image {index}, {percent}% complete\n"
                    )));
                    continue;
                }

                // Terminal of a turn: close reasoning, render images
                if let Some(model_response) = resp.get("modelResponse") {
                    if self.image_think_active && self.think_opened {
                        self.think_opened = false;
                        yield Ok(self.sse_content("\n</think>\n"));
                    }
                    self.image_think_active = false;

                    for url in collect_image_urls(model_response) {
                        let rendered = render_image_markdown(&url);
                        yield Ok(self.sse_content(&format!("{rendered}\n")));
                    }

                    if let Some(hash) = model_response
                        .get("metadata")
                        .and_then(|m| m.get("llm_info"))
                        .and_then(|l| l.get("modelHash"))
                        .and_then(|v| v.as_str())
                    {
                        self.fingerprint = hash.to_string();
                    }
                    continue;
                }

                // Inline image card
                if let Some(card) = resp.get("cardAttachment") {
                    let Some(json_data) =
                        card.get("jsonData").and_then(|v| v.as_str()).map(str::trim)
                    else {
                        continue;
                    };
                    if json_data.is_empty() {
                        continue;
                    }
                    let Ok(card_data) = serde_json::from_str::<Value>(json_data) else {
                        continue;
                    };
                    let image = card_data.get("image").cloned().unwrap_or(Value::Null);
                    let Some(original) = image.get("original").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let title = image
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .replace('\n', " ")
                        .trim()
                        .to_string();
                    let title = if title.is_empty() { "image".to_string() } else { title };
                    yield Ok(self.sse_content(&format!("![{title}]({original})\n")));
                    continue;
                }

                // Text delta
                if let Some(token_value) = resp.get("token") {
                    let Some(token_text) = token_value.as_str() else { continue };
                    if token_text.is_empty() {
                        continue;
                    }
                    let rollout = self.rollout_id.clone();
                    let filtered = self.filter.filter_token(token_text, &rollout);
                    if filtered.is_empty() {
                        continue;
                    }

                    let in_think = is_thinking || self.image_think_active;
                    if in_think {
                        if !self.show_think {
                            continue;
                        }
                        if !self.think_opened {
                            self.think_opened = true;
                            yield Ok(self.sse_content("<think>\n"));
                        }
                    } else if self.think_opened {
                        self.think_opened = false;
                        yield Ok(self.sse_content("\n</think>\n"));
                    }
                    yield Ok(self.sse_content(&filtered));
                }
            }

            if self.think_opened {
                self.think_opened = false;
                yield Ok(self.sse_content("</think>\n"));
            }
            if !self.role_sent {
                // An empty upstream stream still gets well-formed framing
                yield Ok(self.sse_role());
            }
            yield Ok(self.sse_finish());
            yield Ok("data: [DONE]\n\n".to_string());
        };

        (outcome, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn line_stream(lines: Vec<&str>) -> impl Stream<Item = Result<String, AppError>> + Send {
        stream::iter(
            lines
                .into_iter()
                .map(|l| Ok(l.to_string()))
                .collect::<Vec<Result<String, AppError>>>(),
        )
    }

    async fn run(
        processor: StreamProcessor,
        lines: Vec<&str>,
    ) -> (Vec<Value>, Vec<String>, StreamOutcome) {
        let (outcome, frames) = processor.process(line_stream(lines));
        futures::pin_mut!(frames);

        let mut chunks = Vec::new();
        let mut raw = Vec::new();
        while let Some(frame) = frames.next().await {
            let frame = frame.expect("stream should not error");
            raw.push(frame.clone());
            let payload = frame
                .strip_prefix("data: ")
                .unwrap()
                .trim_end()
                .to_string();
            if payload != "[DONE]" {
                chunks.push(serde_json::from_str(&payload).unwrap());
            }
        }
        let captured = outcome.lock().unwrap().clone();
        (chunks, raw, captured)
    }

    fn content_of(chunk: &Value) -> String {
        chunk["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string()
    }

    fn processor() -> StreamProcessor {
        StreamProcessor::new(
            "grok-3",
            Some("conv-test".to_string()),
            true,
            vec!["xai:tool_usage_card".to_string()],
        )
    }

    #[tokio::test]
    async fn happy_path_framing() {
        let lines = vec![
            r#"{"result":{"conversation":{"conversationId":"C1"},"response":{"responseId":"R1","token":"pong"}}}"#,
            r#"{"result":{"response":{"modelResponse":{"responseId":"R1","message":"pong"}}}}"#,
        ];
        let (chunks, raw, captured) = run(processor(), lines).await;

        // Role chunk first
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        // Then the delta
        assert_eq!(content_of(&chunks[1]), "pong");
        // Exactly one stop chunk, then [DONE]
        let stops: Vec<&Value> = chunks
            .iter()
            .filter(|c| c["choices"][0]["finish_reason"] == "stop")
            .collect();
        assert_eq!(stops.len(), 1);
        assert_eq!(raw.last().unwrap(), "data: [DONE]\n\n");

        // Conversation id echoed on chunks, upstream ids captured
        assert_eq!(chunks[1]["conversation_id"], "conv-test");
        assert_eq!(captured.conversation_id.as_deref(), Some("C1"));
        assert_eq!(captured.response_id.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn think_markers_balance() {
        let lines = vec![
            r#"{"result":{"response":{"isThinking":true,"token":"let me think"}}}"#,
            r#"{"result":{"response":{"isThinking":true,"token":" more"}}}"#,
            r#"{"result":{"response":{"isThinking":false,"token":"answer"}}}"#,
        ];
        let (chunks, _, _) = run(processor(), lines).await;

        let contents: Vec<String> = chunks.iter().map(content_of).collect();
        let opens = contents.iter().filter(|c| c.contains("<think>")).count();
        let closes = contents.iter().filter(|c| c.contains("</think>")).count();
        assert_eq!(opens, 1);
        assert_eq!(closes, 1);

        let open_at = contents.iter().position(|c| c.contains("<think>")).unwrap();
        let close_at = contents.iter().position(|c| c.contains("</think>")).unwrap();
        assert!(open_at < close_at);
    }

    #[tokio::test]
    async fn unclosed_think_is_closed_at_eof() {
        let lines = vec![r#"{"result":{"response":{"isThinking":true,"token":"thinking"}}}"#];
        let (chunks, _, _) = run(processor(), lines).await;

        let contents: Vec<String> = chunks.iter().map(content_of).collect();
        let opens = contents.iter().filter(|c| c.contains("<think>")).count();
        let closes = contents.iter().filter(|c| c.contains("</think>")).count();
        assert_eq!(opens, closes);
    }

    #[tokio::test]
    async fn disabled_thinking_suppresses_markers_and_tokens() {
        let processor = StreamProcessor::new("grok-3", None, false, vec![]);
        let lines = vec![
            r#"{"result":{"response":{"isThinking":true,"token":"hidden"}}}"#,
            r#"{"result":{"response":{"token":"visible"}}}"#,
        ];
        let (chunks, _, _) = run(processor, lines).await;

        let contents: Vec<String> = chunks.iter().map(content_of).collect();
        assert!(!contents.iter().any(|c| c.contains("think")));
        assert!(!contents.iter().any(|c| c.contains("hidden")));
        assert!(contents.iter().any(|c| c == "visible"));
    }

    #[tokio::test]
    async fn tool_card_across_chunks_becomes_label_line() {
        let lines = vec![
            r#"{"result":{"response":{"rolloutId":"ro-1","token":"pre<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name>"}}}"#,
            r#"{"result":{"response":{"token":"<xai:tool_args>{\"query\":\"q\"}</xai:tool_args>"}}}"#,
            r#"{"result":{"response":{"token":"</xai:tool_usage_card>post"}}}"#,
        ];
        let (chunks, _, _) = run(processor(), lines).await;

        // The label lands on its own line even though the preceding text
        // arrived in an earlier chunk
        let merged: String = chunks.iter().map(|c| content_of(c)).collect();
        assert_eq!(merged, "pre\n[ro-1][WebSearch] q\npost");
    }

    #[tokio::test]
    async fn tool_card_at_stream_start_gets_no_leading_newline() {
        let lines = vec![
            r#"{"result":{"response":{"rolloutId":"ro-1","token":"<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name><xai:tool_args>{\"query\":\"q\"}</xai:tool_args></xai:tool_usage_card>tail"}}}"#,
        ];
        let (chunks, _, _) = run(processor(), lines).await;
        let merged: String = chunks.iter().map(|c| content_of(c)).collect();
        assert_eq!(merged, "[ro-1][WebSearch] q\ntail");
    }

    #[tokio::test]
    async fn filtered_tags_drop_their_chunks() {
        let processor = StreamProcessor::new(
            "grok-3",
            None,
            true,
            vec!["grok:render".to_string()],
        );
        let lines = vec![
            r#"{"result":{"response":{"token":"keep"}}}"#,
            r#"{"result":{"response":{"token":"<grok:render card_id=\"1\">"}}}"#,
            r#"{"result":{"response":{"token":"also keep"}}}"#,
        ];
        let (chunks, _, _) = run(processor, lines).await;

        let contents: Vec<String> = chunks.iter().map(content_of).collect();
        assert!(contents.contains(&"keep".to_string()));
        assert!(contents.contains(&"also keep".to_string()));
        assert!(!contents.iter().any(|c| c.contains("grok:render")));
    }

    #[tokio::test]
    async fn image_progress_streams_inside_think() {
        let lines = vec![
            r#"{"result":{"response":{"streamingImageGenerationResponse":{"imageIndex":0,"progress":40}}}}"#,
            r#"{"result":{"response":{"modelResponse":{"responseId":"R1","generatedImageUrls":["users/u/gen/img-1/image.jpg"]}}}}"#,
        ];
        let (chunks, _, _) = run(processor(), lines).await;

        let contents: Vec<String> = chunks.iter().map(content_of).collect();
        assert!(contents.iter().any(|c| c.contains("<think>")));
        assert!(contents
            .iter()
            .any(|c| c.contains("Generating image 1, 40% complete")));
        assert!(contents.iter().any(|c| c.contains("</think>")));
        assert!(contents
            .iter()
            .any(|c| c.contains("![image](https://assets.grok.com/users/u/gen/img-1/image.jpg)")));
    }

    #[tokio::test]
    async fn card_attachment_renders_markdown_image() {
        let lines = vec![
            r#"{"result":{"response":{"cardAttachment":{"jsonData":"{\"image\":{\"original\":\"https://img.example/x.png\",\"title\":\"A\\nB\"}}"}}}}"#,
        ];
        let (chunks, _, _) = run(processor(), lines).await;
        let contents: Vec<String> = chunks.iter().map(content_of).collect();
        assert!(contents
            .iter()
            .any(|c| c.contains("![A B](https://img.example/x.png)")));
    }

    #[tokio::test]
    async fn unparseable_lines_are_skipped() {
        let lines = vec![
            "not json at all",
            "",
            "data: [DONE]",
            r#"{"result":{"response":{"token":"ok"}}}"#,
        ];
        let (chunks, _, _) = run(processor(), lines).await;
        let contents: Vec<String> = chunks.iter().map(content_of).collect();
        assert!(contents.contains(&"ok".to_string()));
    }

    #[tokio::test]
    async fn later_model_hash_wins() {
        let lines = vec![
            r#"{"result":{"response":{"llmInfo":{"modelHash":"early"},"token":"a"}}}"#,
            r#"{"result":{"response":{"modelResponse":{"responseId":"R1","metadata":{"llm_info":{"modelHash":"late"}}}}}}"#,
            r#"{"result":{"response":{"token":"b"}}}"#,
        ];
        let (chunks, _, _) = run(processor(), lines).await;
        let last_content_chunk = chunks
            .iter()
            .rev()
            .find(|c| !content_of(c).is_empty())
            .unwrap();
        assert_eq!(last_content_chunk["system_fingerprint"], "late");
    }

    #[tokio::test]
    async fn stream_error_surfaces_and_stops_framing() {
        let lines: Vec<Result<String, AppError>> = vec![
            Ok(r#"{"result":{"response":{"token":"partial"}}}"#.to_string()),
            Err(AppError::StreamTimeout {
                tier: crate::error::TimeoutTier::Idle,
                seconds: 2,
            }),
        ];
        let (_, frames) = processor().process(stream::iter(lines));
        futures::pin_mut!(frames);

        let mut saw_error = false;
        let mut saw_done = false;
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    if frame.contains("[DONE]") {
                        saw_done = true;
                    }
                }
                Err(e) => {
                    assert!(matches!(e, AppError::StreamTimeout { .. }));
                    saw_error = true;
                }
            }
        }
        assert!(saw_error);
        assert!(!saw_done);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Filter chain
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn filter_is_idempotent_outside_buffering() {
        let mut filter = TokenFilter::new(vec![TOOL_CARD_TAG.to_string()]);
        let input = "plain text with no cards";
        let once = filter.filter_token(input, "");
        assert!(!filter.buffering());
        let twice = filter.filter_token(&once, "");
        assert_eq!(once, twice);

        let card = "x<xai:tool_usage_card><xai:tool_name>t</xai:tool_name></xai:tool_usage_card>y";
        let once = filter.filter_token(card, "");
        assert!(!filter.buffering());
        let twice = filter.filter_token(&once, "");
        assert_eq!(once, twice);
    }

    #[test]
    fn tool_text_extraction_labels() {
        let card = r#"<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name><xai:tool_args>{"query":"rust"}</xai:tool_args></xai:tool_usage_card>"#;
        assert_eq!(extract_tool_text(card, "ro"), "[ro][WebSearch] rust");

        let card = r#"<xai:tool_usage_card><xai:tool_name><![CDATA[search_images]]></xai:tool_name><xai:tool_args>{"description":"cats"}</xai:tool_args></xai:tool_usage_card>"#;
        assert_eq!(extract_tool_text(card, ""), "[SearchImage] cats");

        let card = r#"<xai:tool_usage_card><xai:tool_name>custom_tool</xai:tool_name></xai:tool_usage_card>"#;
        assert_eq!(extract_tool_text(card, "ro"), "custom_tool");
    }

    #[test]
    fn image_url_collection_is_recursive_and_deduped() {
        let value = json!({
            "modelResponse": {
                "generatedImageUrls": ["a.jpg", "b.jpg"],
                "nested": {"imageUrls": ["a.jpg", "c.jpg"]},
                "deep": [{"imageURLs": "d.jpg"}],
            }
        });
        assert_eq!(collect_image_urls(&value), vec!["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
    }
}
