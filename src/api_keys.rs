// API key management - managed keys alongside the primary admin key
//
// Keys are opaque `sk-` strings with a display name, an active flag and
// usage counters. Persisted as `api_keys.json`.

use crate::config::ApiKeysSettings;
use crate::persist::Debounce;
use crate::storage::Storage;
use anyhow::Result;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub name: String,
    pub created_at: i64,
    pub is_active: bool,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used_at: Option<i64>,
}

/// Shorten a key for display and logs.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return key.to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

fn generate_key() -> String {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    format!(
        "sk-{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    )
}

pub struct ApiKeyManager {
    keys: Mutex<Vec<ApiKey>>,
    storage: Arc<dyn Storage>,
    debounce: Arc<Debounce>,
}

impl ApiKeyManager {
    pub fn new(storage: Arc<dyn Storage>, settings: ApiKeysSettings) -> Arc<Self> {
        let debounce = Debounce::new(settings.save_delay_ms);
        Arc::new(Self {
            keys: Mutex::new(Vec::new()),
            storage,
            debounce,
        })
    }

    pub fn debounce(&self) -> Arc<Debounce> {
        self.debounce.clone()
    }

    pub async fn load(&self) -> Result<()> {
        let doc = self.storage.load_json("api_keys.json").await?;
        let mut keys = self.keys.lock().await;
        keys.clear();
        if let Some(items) = doc.as_ref().and_then(|d| d.as_array()) {
            for item in items {
                match serde_json::from_value::<ApiKey>(item.clone()) {
                    Ok(key) => keys.push(key),
                    Err(e) => tracing::warn!("skipping malformed api key entry: {e}"),
                }
            }
        }
        tracing::info!("api key manager loaded: {} keys", keys.len());
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let doc = {
            let keys = self.keys.lock().await;
            serde_json::to_value(&*keys)?
        };
        self.storage.save_json("api_keys.json", &doc).await
    }

    pub async fn flush(&self) -> Result<()> {
        if self.debounce.take_dirty() {
            self.save().await?;
        }
        Ok(())
    }

    pub async fn add(&self, name: &str) -> ApiKey {
        let key = ApiKey {
            key: generate_key(),
            name: if name.is_empty() { "unnamed" } else { name }.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            is_active: true,
            usage_count: 0,
            last_used_at: None,
        };
        self.keys.lock().await.push(key.clone());
        self.debounce.mark();
        key
    }

    pub async fn delete(&self, targets: &[String]) -> usize {
        let mut keys = self.keys.lock().await;
        let before = keys.len();
        keys.retain(|k| !targets.contains(&k.key));
        let deleted = before - keys.len();
        drop(keys);
        if deleted > 0 {
            self.debounce.mark();
        }
        deleted
    }

    pub async fn update(&self, key: &str, name: Option<&str>, is_active: Option<bool>) -> bool {
        let mut keys = self.keys.lock().await;
        let Some(entry) = keys.iter_mut().find(|k| k.key == key) else {
            return false;
        };
        if let Some(name) = name {
            entry.name = name.to_string();
        }
        if let Some(is_active) = is_active {
            entry.is_active = is_active;
        }
        drop(keys);
        self.debounce.mark();
        true
    }

    /// None when the key is unknown or disabled.
    pub async fn validate(&self, key: &str) -> Option<ApiKey> {
        let keys = self.keys.lock().await;
        keys.iter()
            .find(|k| k.key == key && k.is_active)
            .cloned()
    }

    pub async fn record_usage(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        let mut keys = self.keys.lock().await;
        if let Some(entry) = keys.iter_mut().find(|k| k.key == key) {
            entry.usage_count += 1;
            entry.last_used_at = Some(chrono::Utc::now().timestamp());
            drop(keys);
            self.debounce.mark();
        }
    }

    pub async fn list(&self) -> Vec<ApiKey> {
        self.keys.lock().await.clone()
    }

    pub async fn has_keys(&self) -> bool {
        !self.keys.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn manager() -> (Arc<ApiKeyManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()).unwrap());
        (ApiKeyManager::new(storage, ApiKeysSettings::default()), dir)
    }

    #[tokio::test]
    async fn lifecycle_add_validate_disable_delete() {
        let (manager, _dir) = manager();
        let created = manager.add("ci").await;
        assert!(created.key.starts_with("sk-"));

        assert!(manager.validate(&created.key).await.is_some());
        assert!(manager.validate("sk-unknown").await.is_none());

        manager.update(&created.key, None, Some(false)).await;
        assert!(manager.validate(&created.key).await.is_none());

        assert_eq!(manager.delete(&[created.key.clone()]).await, 1);
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn usage_tracking() {
        let (manager, _dir) = manager();
        let created = manager.add("ci").await;
        manager.record_usage(&created.key).await;
        manager.record_usage(&created.key).await;

        let listed = manager.list().await;
        assert_eq!(listed[0].usage_count, 2);
        assert!(listed[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn keys_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()).unwrap());

        let manager = ApiKeyManager::new(storage.clone(), ApiKeysSettings::default());
        let created = manager.add("ci").await;
        manager.save().await.unwrap();

        let fresh = ApiKeyManager::new(storage, ApiKeysSettings::default());
        fresh.load().await.unwrap();
        assert!(fresh.validate(&created.key).await.is_some());
    }

    #[test]
    fn masking() {
        assert_eq!(mask_key("sk-abcdefgh12345678"), "sk-a...5678");
        assert_eq!(mask_key("short"), "short");
    }
}
