// Conversation manager - multi-turn continuity across tokens
//
// Maps gateway conversation ids onto upstream conversation state. Three
// indexes: the primary context table, a history-hash index for auto-resume
// (clients that never send a conversation id still land in their own
// context), and a per-token id list so one token's contexts can be capped.
//
// The history hash covers system and user text only. Assistant turns are
// generated by the upstream and vary between runs, so hashing them would
// break resumption; their presence still matters for the exclude-last-user
// rule.

use crate::config::ConversationSettings;
use crate::persist::Debounce;
use crate::storage::Storage;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Upstream-side state pinned to one gateway conversation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    /// Upstream conversation id
    pub conversation_id: String,
    /// Upstream response id to continue from
    pub last_response_id: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub message_count: u32,
    /// Token the conversation currently lives under
    pub token: String,
    #[serde(default)]
    pub history_hash: String,
    #[serde(default)]
    pub share_link_id: String,
}

/// Mutation applied to an existing context. Unset fields keep their value.
#[derive(Debug, Default)]
pub struct ContextUpdate {
    /// New upstream response id; empty keeps the old one
    pub response_id: String,
    /// Full message list, for recomputing the history hash
    pub messages: Option<Vec<Value>>,
    pub share_link_id: Option<String>,
    pub conversation_id: Option<String>,
    pub token: Option<String>,
    /// Whether this update represents a completed turn
    pub increment_message: bool,
}

impl ContextUpdate {
    pub fn turn(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            increment_message: true,
            ..Default::default()
        }
    }
}

/// Gateway conversation id: `conv-` plus 24 hex chars.
pub fn generate_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("conv-{}", &hex[..24])
}

/// Deterministic 16-hex digest of the canonicalized system+user history.
///
/// With `exclude_last_user`, the most recent user line is dropped - but only
/// when an assistant turn exists, i.e. the conversation actually advanced.
/// Empty input hashes to the empty string, which never auto-matches.
pub fn compute_history_hash(messages: &[Value], exclude_last_user: bool) -> String {
    if messages.is_empty() {
        return String::new();
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut user_parts: Vec<String> = Vec::new();
    let mut has_assistant = false;

    for message in messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
        match role {
            "system" => system_parts.push(format!("system:{}", text_of(message))),
            "user" => user_parts.push(format!("user:{}", text_of(message))),
            "assistant" => has_assistant = true,
            _ => {}
        }
    }

    if exclude_last_user && has_assistant && !user_parts.is_empty() {
        user_parts.pop();
    }

    system_parts.extend(user_parts);
    if system_parts.is_empty() {
        return String::new();
    }

    let mut hasher = Sha256::new();
    hasher.update(system_parts.join("\n").as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")[..16].to_string()
}

/// Text content of one message; list-form content joins its `text` items.
fn text_of(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter(|i| i.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct Inner {
    conversations: HashMap<String, ConversationContext>,
    token_conversations: HashMap<String, Vec<String>>,
    hash_index: HashMap<String, String>,
}

impl Inner {
    fn detach_indexes(&mut self, id: &str, context: &ConversationContext) {
        if !context.history_hash.is_empty() {
            // Only drop the index entry if it still points at us
            if self.hash_index.get(&context.history_hash).map(String::as_str) == Some(id) {
                self.hash_index.remove(&context.history_hash);
            }
        }
        if let Some(ids) = self.token_conversations.get_mut(&context.token) {
            ids.retain(|existing| existing != id);
        }
    }
}

/// Owns conversation contexts and persists them as `conversations.json`.
pub struct ConversationStore {
    inner: Mutex<Inner>,
    storage: Arc<dyn Storage>,
    settings: ConversationSettings,
    debounce: Arc<Debounce>,
}

impl ConversationStore {
    pub fn new(storage: Arc<dyn Storage>, settings: ConversationSettings) -> Arc<Self> {
        let debounce = Debounce::new(settings.save_delay_ms);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                conversations: HashMap::new(),
                token_conversations: HashMap::new(),
                hash_index: HashMap::new(),
            }),
            storage,
            settings,
            debounce,
        })
    }

    pub fn debounce(&self) -> Arc<Debounce> {
        self.debounce.clone()
    }

    pub async fn load(&self) -> Result<()> {
        let doc = self.storage.load_json("conversations.json").await?;
        let mut inner = self.inner.lock().await;
        inner.conversations.clear();
        inner.token_conversations.clear();
        inner.hash_index.clear();

        if let Some(doc) = doc {
            if let Some(map) = doc.get("conversations").and_then(|c| c.as_object()) {
                for (id, raw) in map {
                    match serde_json::from_value::<ConversationContext>(raw.clone()) {
                        Ok(context) => {
                            if !context.history_hash.is_empty() {
                                inner
                                    .hash_index
                                    .insert(context.history_hash.clone(), id.clone());
                            }
                            inner.conversations.insert(id.clone(), context);
                        }
                        Err(e) => tracing::warn!("skipping malformed conversation {id}: {e}"),
                    }
                }
            }
            if let Some(map) = doc.get("token_conversations").and_then(|c| c.as_object()) {
                for (token, ids) in map {
                    let ids: Vec<String> = ids
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default();
                    inner.token_conversations.insert(token.clone(), ids);
                }
            }
        }

        tracing::info!(
            "conversation store loaded: {} contexts",
            inner.conversations.len()
        );
        drop(inner);
        self.cleanup_expired().await;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let doc = {
            let inner = self.inner.lock().await;
            json!({
                "conversations": inner.conversations,
                "token_conversations": inner.token_conversations,
            })
        };
        self.storage.save_json("conversations.json", &doc).await
    }

    pub async fn flush(&self) -> Result<()> {
        if self.debounce.take_dirty() {
            self.save().await?;
        }
        Ok(())
    }

    /// Auto-resume: match the history *before* the new turn against stored
    /// hashes. Stale matches clean themselves up.
    pub async fn find_by_history(&self, messages: &[Value]) -> Option<String> {
        let hash = compute_history_hash(messages, true);
        if hash.is_empty() {
            return None;
        }
        let candidate = {
            let inner = self.inner.lock().await;
            inner.hash_index.get(&hash).cloned()
        }?;
        if self.get(&candidate).await.is_some() {
            tracing::info!("conversation auto-matched: {candidate} hash={hash}");
            return Some(candidate);
        }
        let mut inner = self.inner.lock().await;
        if inner.hash_index.get(&hash).map(String::as_str) == Some(candidate.as_str()) {
            inner.hash_index.remove(&hash);
        }
        None
    }

    /// Create a context for a finished first exchange.
    pub async fn create(
        &self,
        token: &str,
        upstream_conversation_id: &str,
        upstream_response_id: &str,
        messages: Option<&[Value]>,
        gateway_id: Option<String>,
    ) -> String {
        let id = gateway_id.unwrap_or_else(generate_id);
        let history_hash = messages
            .map(|m| compute_history_hash(m, false))
            .unwrap_or_default();
        let now = now_epoch();

        let context = ConversationContext {
            conversation_id: upstream_conversation_id.to_string(),
            last_response_id: upstream_response_id.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 1,
            token: token.to_string(),
            history_hash: history_hash.clone(),
            share_link_id: String::new(),
        };

        {
            let mut inner = self.inner.lock().await;
            if !history_hash.is_empty() {
                inner.hash_index.insert(history_hash, id.clone());
            }
            inner.conversations.insert(id.clone(), context);
            inner
                .token_conversations
                .entry(token.to_string())
                .or_default()
                .push(id.clone());
            self.enforce_token_cap(&mut inner, token);
        }
        self.debounce.mark();
        id
    }

    /// Look up a context, expiring it on read when past TTL.
    pub async fn get(&self, id: &str) -> Option<ConversationContext> {
        let context = {
            let inner = self.inner.lock().await;
            inner.conversations.get(id).cloned()
        }?;
        if now_epoch() - context.updated_at > self.settings.ttl_seconds as f64 {
            self.delete(id).await;
            return None;
        }
        Some(context)
    }

    /// Apply a mutation to an existing context. Recomputes and reindexes the
    /// history hash when a message list is supplied; the old hash entry is
    /// removed before the new one lands.
    pub async fn update(&self, id: &str, update: ContextUpdate) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(context) = inner.conversations.get_mut(id) else {
            return;
        };

        if !update.response_id.is_empty() {
            context.last_response_id = update.response_id;
        }
        context.updated_at = now_epoch();
        if update.increment_message {
            context.message_count += 1;
        }
        if let Some(share_link_id) = update.share_link_id {
            context.share_link_id = share_link_id;
        }
        if let Some(conversation_id) = update.conversation_id {
            context.conversation_id = conversation_id;
        }
        if let Some(token) = update.token {
            if token != context.token {
                let old_token = std::mem::replace(&mut context.token, token.clone());
                let id_owned = id.to_string();
                if let Some(ids) = inner.token_conversations.get_mut(&old_token) {
                    ids.retain(|existing| existing != &id_owned);
                }
                inner
                    .token_conversations
                    .entry(token)
                    .or_default()
                    .push(id_owned);
            }
        }

        if let Some(messages) = update.messages {
            let new_hash = compute_history_hash(&messages, false);
            let context = inner.conversations.get_mut(id).expect("checked above");
            if !new_hash.is_empty() && new_hash != context.history_hash {
                let old_hash = std::mem::replace(&mut context.history_hash, new_hash.clone());
                if !old_hash.is_empty() {
                    inner.hash_index.remove(&old_hash);
                }
                inner.hash_index.insert(new_hash, id.to_string());
            }
        }

        drop(guard);
        self.debounce.mark();
    }

    /// Record a share link without counting a turn.
    pub async fn attach_share_link(&self, id: &str, share_link_id: &str) {
        self.update(
            id,
            ContextUpdate {
                share_link_id: Some(share_link_id.to_string()),
                increment_message: false,
                ..Default::default()
            },
        )
        .await;
    }

    pub async fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(context) = inner.conversations.remove(id) else {
            return false;
        };
        inner.detach_indexes(id, &context);
        drop(inner);
        self.debounce.mark();
        true
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.conversations.clear();
        inner.token_conversations.clear();
        inner.hash_index.clear();
        drop(inner);
        self.debounce.mark();
    }

    /// Evict the oldest contexts once a token exceeds its cap.
    fn enforce_token_cap(&self, inner: &mut Inner, token: &str) {
        let limit = self.settings.max_per_token.max(1);
        let Some(ids) = inner.token_conversations.get(token) else {
            return;
        };
        if ids.len() <= limit {
            return;
        }
        let overflow = ids.len() - limit;
        let evicted: Vec<String> = ids[..overflow].to_vec();
        for id in &evicted {
            if let Some(context) = inner.conversations.remove(id) {
                if inner.hash_index.get(&context.history_hash).map(String::as_str)
                    == Some(id.as_str())
                {
                    inner.hash_index.remove(&context.history_hash);
                }
            }
        }
        if let Some(ids) = inner.token_conversations.get_mut(token) {
            ids.drain(..overflow);
        }
        tracing::debug!("evicted {overflow} contexts for token cap");
    }

    /// Drop every context past TTL. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let ttl = self.settings.ttl_seconds as f64;
        let now = now_epoch();
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .conversations
            .iter()
            .filter(|(_, c)| now - c.updated_at > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(context) = inner.conversations.remove(id) {
                inner.detach_indexes(id, &context);
            }
        }
        let count = expired.len();
        drop(inner);
        if count > 0 {
            tracing::info!("conversation sweep removed {count} expired contexts");
            self.debounce.mark();
        }
        count
    }

    pub async fn list(&self) -> Vec<(String, ConversationContext)> {
        let inner = self.inner.lock().await;
        inner
            .conversations
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect()
    }

    pub async fn stats(&self) -> Value {
        let inner = self.inner.lock().await;
        let total = inner.conversations.len();
        let avg = if total > 0 {
            inner
                .conversations
                .values()
                .map(|c| c.message_count as f64)
                .sum::<f64>()
                / total as f64
        } else {
            0.0
        };
        json!({
            "total_conversations": total,
            "tokens_with_conversations": inner.token_conversations.len(),
            "avg_messages_per_conversation": avg,
            "ttl_seconds": self.settings.ttl_seconds,
        })
    }

    /// Periodic TTL sweep.
    pub fn spawn_cleanup_loop(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let interval = Duration::from_secs(store.settings.cleanup_interval_sec.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                store.cleanup_expired().await;
            }
        })
    }

    #[cfg(test)]
    pub(crate) async fn force_updated_at(&self, id: &str, updated_at: f64) {
        let mut inner = self.inner.lock().await;
        if let Some(context) = inner.conversations.get_mut(id) {
            context.updated_at = updated_at;
        }
    }
}
