// OpenAI message extraction
//
// The upstream takes a single message string per request. A fresh
// conversation flattens the whole history into one prompt (each earlier turn
// prefixed with its role, the final user turn bare); a continuation sends
// only the latest user turn because the upstream already holds the history.
// Attachments ride separately: data-URI files/audio and image URLs are
// collected for upload.

use serde_json::Value;

#[derive(Debug, Default, PartialEq)]
pub struct ExtractedMessage {
    pub text: String,
    pub file_attachments: Vec<String>,
    pub image_attachments: Vec<String>,
}

/// Collect the text parts and attachments of one message's content.
fn collect_parts(
    content: &Value,
    parts: &mut Vec<String>,
    files: &mut Vec<String>,
    images: &mut Vec<String>,
) {
    match content {
        Value::String(s) => {
            if !s.trim().is_empty() {
                parts.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                match item.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            let text = text.trim();
                            if !text.is_empty() {
                                parts.push(text.to_string());
                            }
                        }
                    }
                    "image_url" => {
                        if let Some(url) = item
                            .get("image_url")
                            .and_then(|i| i.get("url"))
                            .and_then(|u| u.as_str())
                        {
                            if !url.is_empty() {
                                images.push(url.to_string());
                            }
                        }
                    }
                    "input_audio" => {
                        if let Some(data) = item
                            .get("input_audio")
                            .and_then(|a| a.get("data"))
                            .and_then(|d| d.as_str())
                        {
                            if !data.is_empty() {
                                files.push(data.to_string());
                            }
                        }
                    }
                    "file" => {
                        if let Some(raw) = item
                            .get("file")
                            .and_then(|f| f.get("file_data"))
                            .and_then(|d| d.as_str())
                        {
                            if !raw.is_empty() {
                                files.push(raw.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Extract the upstream message string plus attachments.
pub fn extract(messages: &[Value], is_continue: bool) -> ExtractedMessage {
    let mut out = ExtractedMessage::default();

    if is_continue {
        // Continuation: only the last user turn travels
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
            .or_else(|| messages.last());
        let Some(message) = last_user else {
            return out;
        };

        let mut parts = Vec::new();
        if let Some(content) = message.get("content") {
            collect_parts(
                content,
                &mut parts,
                &mut out.file_attachments,
                &mut out.image_attachments,
            );
        }
        out.text = parts.join("\n");
        return out;
    }

    // Fresh conversation: flatten the whole history
    let mut extracted: Vec<(String, String)> = Vec::new();
    for message in messages {
        let role = message
            .get("role")
            .and_then(|r| r.as_str())
            .filter(|r| !r.is_empty())
            .unwrap_or("user")
            .to_string();
        let mut parts = Vec::new();
        if let Some(content) = message.get("content") {
            collect_parts(
                content,
                &mut parts,
                &mut out.file_attachments,
                &mut out.image_attachments,
            );
        }
        if !parts.is_empty() {
            extracted.push((role, parts.join("\n")));
        }
    }

    let last_user_index = extracted.iter().rposition(|(role, _)| role == "user");
    let texts: Vec<String> = extracted
        .iter()
        .enumerate()
        .map(|(i, (role, text))| {
            if Some(i) == last_user_index {
                text.clone()
            } else {
                format!("{role}: {text}")
            }
        })
        .collect();

    out.text = texts.join("\n\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(role: &str, content: &str) -> Value {
        json!({"role": role, "content": content})
    }

    #[test]
    fn history_flattens_with_role_prefixes() {
        let messages = vec![
            msg("system", "Be brief"),
            msg("user", "hi"),
            msg("assistant", "hello"),
            msg("user", "what now"),
        ];
        let extracted = extract(&messages, false);
        assert_eq!(
            extracted.text,
            "system: Be brief\n\nuser: hi\n\nassistant: hello\n\nwhat now"
        );
    }

    #[test]
    fn continuation_sends_only_last_user_turn() {
        let messages = vec![
            msg("system", "Be brief"),
            msg("user", "hi"),
            msg("assistant", "hello"),
            msg("user", "what now"),
        ];
        let extracted = extract(&messages, true);
        assert_eq!(extracted.text, "what now");
        assert!(extracted.file_attachments.is_empty());
    }

    #[test]
    fn continuation_without_user_falls_back_to_last_message() {
        let messages = vec![msg("system", "Be brief"), msg("assistant", "hello")];
        let extracted = extract(&messages, true);
        assert_eq!(extracted.text, "hello");
    }

    #[test]
    fn structured_content_collects_attachments() {
        let messages = vec![json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "describe this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAA"}},
                {"type": "file", "file": {"file_data": "data:application/pdf;base64,BBB"}},
            ],
        })];
        let extracted = extract(&messages, false);
        assert_eq!(extracted.text, "describe this");
        assert_eq!(extracted.image_attachments, vec!["data:image/png;base64,AAA"]);
        assert_eq!(
            extracted.file_attachments,
            vec!["data:application/pdf;base64,BBB"]
        );
    }

    #[test]
    fn blank_messages_are_skipped() {
        let messages = vec![msg("user", "  "), msg("user", "real")];
        let extracted = extract(&messages, false);
        assert_eq!(extracted.text, "real");
    }
}
