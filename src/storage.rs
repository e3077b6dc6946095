// Storage module - persisted JSON blob store
//
// Every stateful manager (tokens, conversations, stats, logs, api keys)
// persists a single named JSON document through this contract. Documents are
// replaced whole on flush; the local driver writes to a temp file and renames
// so readers never observe a torn document.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Blob store contract: named JSON documents, replaced atomically.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Load a document by name. `Ok(None)` when it has never been saved.
    async fn load_json(&self, name: &str) -> Result<Option<Value>>;

    /// Replace a document atomically.
    async fn save_json(&self, name: &str, value: &Value) -> Result<()>;

    /// Release any held resources. The local driver has none.
    async fn close(&self) -> Result<()>;
}

/// Local-filesystem driver: one file per document under a data directory.
#[derive(Debug)]
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn load_json(&self, name: &str) -> Result<Option<Value>> {
        let path = self.path_for(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt document {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn save_json(&self, name: &str, value: &Value) -> Result<()> {
        let path = self.path_for(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let bytes = serde_json::to_vec(value).context("failed to serialize document")?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the configured storage backend.
///
/// Only the local driver is compiled in; redis/mysql/pgsql are external
/// deployments of the same contract and are rejected here with a clear
/// message rather than silently falling back to local files.
pub fn open(kind: &str, url: &str, default_dir: &Path) -> Result<std::sync::Arc<dyn Storage>> {
    match kind {
        "local" | "" => {
            let dir = if url.is_empty() {
                default_dir.to_path_buf()
            } else {
                PathBuf::from(url)
            };
            Ok(std::sync::Arc::new(LocalStorage::new(dir)?))
        }
        other => anyhow::bail!(
            "storage backend '{other}' is not compiled into this build \
             (supported: local; configure redis/mysql/pgsql via an external driver)"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        assert!(storage.load_json("tokens.json").await.unwrap().is_none());

        let doc = json!({"pools": {"ssoBasic": []}});
        storage.save_json("tokens.json", &doc).await.unwrap();
        let loaded = storage.load_json("tokens.json").await.unwrap().unwrap();
        assert_eq!(loaded, doc);
    }

    #[tokio::test]
    async fn save_replaces_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        storage
            .save_json("stats.json", &json!({"hourly": {"a": 1}}))
            .await
            .unwrap();
        storage
            .save_json("stats.json", &json!({"daily": {}}))
            .await
            .unwrap();

        let loaded = storage.load_json("stats.json").await.unwrap().unwrap();
        assert!(loaded.get("hourly").is_none());
        assert!(loaded.get("daily").is_some());
    }

    #[test]
    fn unknown_backend_rejected() {
        let err = open("redis", "redis://localhost", Path::new("./data")).unwrap_err();
        assert!(err.to_string().contains("redis"));
    }
}
