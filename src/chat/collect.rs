// Non-streaming collector
//
// Consumes the same upstream line stream as the processor but assembles one
// chat-completion object: the terminal `modelResponse.message` is the body,
// `<grok:render>` card references are substituted from the attached card
// JSON, recursive image URLs are appended, and the filter chain runs once
// over the final text. Stream timeouts degrade to a partial result rather
// than an error; the connection already cost the tokens.

use super::stream::{collect_image_urls, extract_tool_text, normalize_line, render_image_markdown};
use crate::error::AppError;
use futures::{Stream, StreamExt};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

const TOOL_CARD_TAG: &str = "xai:tool_usage_card";

fn render_card_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<grok:render[^>]*card_id="([^"]+)"[^>]*>.*?</grok:render>"#).unwrap()
    })
}

fn rollout_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<rolloutId>(.*?)</rolloutId>").unwrap())
}

fn tool_card_span_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<xai:tool_usage_card[^>]*>.*?</xai:tool_usage_card>").unwrap()
    })
}

/// Result of collecting one upstream response.
pub struct Collected {
    pub completion: Value,
    pub response_id: Option<String>,
    pub conversation_id: Option<String>,
}

pub struct CollectProcessor {
    model: String,
    filter_tags: Vec<String>,
    created: i64,
}

impl CollectProcessor {
    pub fn new(model: impl Into<String>, filter_tags: Vec<String>) -> Self {
        Self {
            model: model.into(),
            filter_tags,
            created: chrono::Utc::now().timestamp(),
        }
    }

    /// Substitute `<grok:render card_id="...">` spans with markdown images
    /// from the card map. A newline is inserted when the span does not start
    /// a line, so the image renders as a block.
    fn render_cards(content: &str, cards: &HashMap<String, (String, String)>) -> String {
        if cards.is_empty() {
            return content.to_string();
        }
        render_card_re()
            .replace_all(content, |caps: &regex::Captures| {
                let Some((title, original)) = caps.get(1).and_then(|id| cards.get(id.as_str()))
                else {
                    return String::new();
                };
                let title = title.replace('\n', " ").trim().to_string();
                let title = if title.is_empty() { "image".to_string() } else { title };
                let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
                let needs_break = start > 0
                    && !matches!(content.as_bytes().get(start - 1), Some(b'\n') | Some(b'\r'));
                let prefix = if needs_break { "\n" } else { "" };
                format!("{prefix}![{title}]({original})")
            })
            .into_owned()
    }

    /// One-pass filter chain over the assembled content.
    fn filter_content(&self, content: &str) -> String {
        if content.is_empty() || self.filter_tags.is_empty() {
            return content.to_string();
        }

        let mut result = content.to_string();
        if self.filter_tags.iter().any(|t| t == TOOL_CARD_TAG) {
            let rollout_id = rollout_id_re()
                .captures(&result)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_default();
            result = tool_card_span_re()
                .replace_all(&result, |caps: &regex::Captures| {
                    let line = extract_tool_text(&caps[0], &rollout_id);
                    if line.is_empty() {
                        String::new()
                    } else {
                        format!("{line}\n")
                    }
                })
                .into_owned();
        }

        for tag in &self.filter_tags {
            if tag == TOOL_CARD_TAG {
                continue;
            }
            let escaped = regex::escape(tag);
            let pattern = format!(r"(?s)<{escaped}[^>]*>.*?</{escaped}>|<{escaped}[^>]*/>");
            if let Ok(re) = Regex::new(&pattern) {
                result = re.replace_all(&result, "").into_owned();
            }
        }
        result
    }

    /// Drain the stream and assemble the completion object.
    pub async fn process<S>(self, lines: S) -> Collected
    where
        S: Stream<Item = Result<String, AppError>> + Send,
    {
        futures::pin_mut!(lines);

        let mut response_id = String::new();
        let mut conversation_id: Option<String> = None;
        let mut fingerprint = String::new();
        let mut content = String::new();

        while let Some(item) = lines.next().await {
            let line = match item {
                Ok(line) => line,
                Err(e) => {
                    // Partial content is better than nothing here
                    tracing::warn!("collect aborted early: {e}");
                    break;
                }
            };
            let Some(line) = normalize_line(&line) else { continue };
            let Ok(data) = serde_json::from_str::<Value>(line) else { continue };

            let result = data.get("result").cloned().unwrap_or(Value::Null);
            let resp = result.get("response").cloned().unwrap_or(Value::Null);

            if let Some(cid) = result
                .get("conversation")
                .and_then(|c| c.get("conversationId"))
                .and_then(|v| v.as_str())
            {
                conversation_id = Some(cid.to_string());
            }
            if fingerprint.is_empty() {
                if let Some(hash) = resp
                    .get("llmInfo")
                    .and_then(|l| l.get("modelHash"))
                    .and_then(|v| v.as_str())
                {
                    fingerprint = hash.to_string();
                }
            }

            let Some(model_response) = resp.get("modelResponse") else {
                continue;
            };

            if let Some(rid) = model_response.get("responseId").and_then(|v| v.as_str()) {
                if !rid.is_empty() {
                    response_id = rid.to_string();
                }
            }
            content = model_response
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();

            // Card id -> (title, original url)
            let mut cards: HashMap<String, (String, String)> = HashMap::new();
            if let Some(raw_cards) = model_response
                .get("cardAttachmentsJson")
                .and_then(|v| v.as_array())
            {
                for raw in raw_cards {
                    let Some(raw) = raw.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                        continue;
                    };
                    let Ok(card) = serde_json::from_str::<Value>(raw) else {
                        continue;
                    };
                    let Some(id) = card.get("id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let image = card.get("image").cloned().unwrap_or(Value::Null);
                    let Some(original) = image.get("original").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let title = image
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    cards.insert(id.to_string(), (title, original.to_string()));
                }
            }
            if !content.is_empty() {
                content = Self::render_cards(&content, &cards);
            }

            let urls = collect_image_urls(model_response);
            if !urls.is_empty() {
                content.push('\n');
                for url in urls {
                    content.push_str(&render_image_markdown(&url));
                    content.push('\n');
                }
            }

            if let Some(hash) = model_response
                .get("metadata")
                .and_then(|m| m.get("llm_info"))
                .and_then(|l| l.get("modelHash"))
                .and_then(|v| v.as_str())
            {
                fingerprint = hash.to_string();
            }
        }

        let content = self.filter_content(&content);
        let completion = json!({
            "id": response_id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "system_fingerprint": fingerprint,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": content,
                    "refusal": null,
                    "annotations": [],
                },
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": 0,
                "completion_tokens": 0,
                "total_tokens": 0,
                "prompt_tokens_details": {
                    "cached_tokens": 0,
                    "text_tokens": 0,
                    "audio_tokens": 0,
                    "image_tokens": 0,
                },
                "completion_tokens_details": {
                    "text_tokens": 0,
                    "audio_tokens": 0,
                    "reasoning_tokens": 0,
                },
            },
        });

        Collected {
            completion,
            response_id: if response_id.is_empty() {
                None
            } else {
                Some(response_id)
            },
            conversation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn lines(items: Vec<&str>) -> impl Stream<Item = Result<String, AppError>> + Send {
        stream::iter(
            items
                .into_iter()
                .map(|l| Ok(l.to_string()))
                .collect::<Vec<Result<String, AppError>>>(),
        )
    }

    fn collector() -> CollectProcessor {
        CollectProcessor::new("grok-3", vec![TOOL_CARD_TAG.to_string()])
    }

    #[tokio::test]
    async fn assembles_final_message() {
        let input = vec![
            r#"{"result":{"conversation":{"conversationId":"C1"},"response":{"token":"po"}}}"#,
            r#"{"result":{"response":{"token":"ng"}}}"#,
            r#"{"result":{"response":{"modelResponse":{"responseId":"R1","message":"pong"}}}}"#,
        ];
        let collected = collector().process(lines(input)).await;

        assert_eq!(collected.response_id.as_deref(), Some("R1"));
        assert_eq!(collected.conversation_id.as_deref(), Some("C1"));
        let completion = &collected.completion;
        assert_eq!(completion["object"], "chat.completion");
        assert_eq!(completion["choices"][0]["message"]["content"], "pong");
        assert_eq!(completion["choices"][0]["finish_reason"], "stop");
        assert_eq!(completion["usage"]["total_tokens"], 0);
    }

    #[tokio::test]
    async fn render_cards_substitute_markdown() {
        let card_json = r#"{\"id\":\"card-1\",\"image\":{\"original\":\"https://img.example/a.png\",\"title\":\"Sunset\"}}"#;
        let line = format!(
            r#"{{"result":{{"response":{{"modelResponse":{{"responseId":"R1","message":"Look: <grok:render card_id=\"card-1\">x</grok:render>","cardAttachmentsJson":["{card_json}"]}}}}}}}}"#
        );
        let collected = collector().process(lines(vec![&line])).await;

        let content = collected.completion["choices"][0]["message"]["content"]
            .as_str()
            .unwrap();
        // Mid-line card gets pushed onto its own line
        assert_eq!(content, "Look: \n![Sunset](https://img.example/a.png)");
    }

    #[tokio::test]
    async fn unknown_card_ids_vanish() {
        let line = r#"{"result":{"response":{"modelResponse":{"responseId":"R1","message":"a<grok:render card_id=\"missing\">x</grok:render>b","cardAttachmentsJson":[]}}}}"#;
        let collected = collector().process(lines(vec![line])).await;
        // No card map at all: spans are left for the filter chain, which
        // does not target grok:render by default
        let content = collected.completion["choices"][0]["message"]["content"]
            .as_str()
            .unwrap();
        assert!(content.contains("a"));
        assert!(content.contains("b"));
    }

    #[tokio::test]
    async fn appends_generated_images() {
        let line = r#"{"result":{"response":{"modelResponse":{"responseId":"R1","message":"done","generatedImageUrls":["users/u/img-9/image.jpg"]}}}}"#;
        let collected = collector().process(lines(vec![line])).await;
        let content = collected.completion["choices"][0]["message"]["content"]
            .as_str()
            .unwrap();
        assert!(content.starts_with("done\n"));
        assert!(content.contains("![image](https://assets.grok.com/users/u/img-9/image.jpg)"));
    }

    #[tokio::test]
    async fn bulk_filter_strips_tool_cards_and_tags() {
        let collector = CollectProcessor::new(
            "grok-3",
            vec![TOOL_CARD_TAG.to_string(), "secret".to_string()],
        );
        let line = r#"{"result":{"response":{"modelResponse":{"responseId":"R1","message":"a<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name><xai:tool_args>{\"query\":\"q\"}</xai:tool_args></xai:tool_usage_card>b<secret>hidden</secret>c"}}}}"#;
        let collected = collector.process(lines(vec![line])).await;
        let content = collected.completion["choices"][0]["message"]["content"]
            .as_str()
            .unwrap();
        assert_eq!(content, "a[WebSearch] q\nbc");
    }

    #[tokio::test]
    async fn timeout_degrades_to_partial_result() {
        let items: Vec<Result<String, AppError>> = vec![
            Ok(
                r#"{"result":{"response":{"modelResponse":{"responseId":"R1","message":"partial"}}}}"#
                    .to_string(),
            ),
            Err(AppError::StreamTimeout {
                tier: crate::error::TimeoutTier::Idle,
                seconds: 2,
            }),
        ];
        let collected = collector().process(stream::iter(items)).await;
        assert_eq!(
            collected.completion["choices"][0]["message"]["content"],
            "partial"
        );
        assert_eq!(collected.response_id.as_deref(), Some("R1"));
    }
}
