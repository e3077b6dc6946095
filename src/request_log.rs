// Request audit log - bounded ring, newest first
//
// One entry per completed (or failed) client request. API keys are stored
// masked; the full key never reaches this log. Persisted as `logs.json`.

use crate::config::LogsSettings;
use crate::persist::Debounce;
use crate::storage::Storage;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub time: String,
    pub timestamp: f64,
    #[serde(default)]
    pub ip: String,
    pub model: String,
    /// Seconds, rounded to milliseconds
    pub duration: f64,
    pub status: u16,
    #[serde(default)]
    pub key_masked: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub stream: bool,
}

pub struct RequestLogger {
    logs: Mutex<VecDeque<LogEntry>>,
    storage: Arc<dyn Storage>,
    settings: LogsSettings,
    debounce: Arc<Debounce>,
}

impl RequestLogger {
    pub fn new(storage: Arc<dyn Storage>, settings: LogsSettings) -> Arc<Self> {
        let debounce = Debounce::new(settings.save_delay_ms);
        Arc::new(Self {
            logs: Mutex::new(VecDeque::new()),
            storage,
            settings,
            debounce,
        })
    }

    pub fn debounce(&self) -> Arc<Debounce> {
        self.debounce.clone()
    }

    pub async fn load(&self) -> Result<()> {
        let doc = self.storage.load_json("logs.json").await?;
        let mut logs = self.logs.lock().await;
        logs.clear();
        if let Some(items) = doc.as_ref().and_then(|d| d.as_array()) {
            let max_len = self.settings.max_len.max(1);
            for item in items.iter().take(max_len) {
                match serde_json::from_value::<LogEntry>(item.clone()) {
                    Ok(entry) => logs.push_back(entry),
                    Err(e) => tracing::warn!("skipping malformed log entry: {e}"),
                }
            }
        }
        tracing::info!("request logger loaded: {} entries", logs.len());
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let doc = {
            let logs = self.logs.lock().await;
            serde_json::to_value(logs.iter().collect::<Vec<_>>())?
        };
        self.storage.save_json("logs.json", &doc).await
    }

    pub async fn flush(&self) -> Result<()> {
        if self.debounce.take_dirty() {
            self.save().await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log(
        &self,
        model: &str,
        status: u16,
        duration_ms: u64,
        ip: &str,
        key_masked: &str,
        error: Option<&str>,
        stream: bool,
    ) {
        let now = chrono::Local::now();
        let entry = LogEntry {
            id: now.timestamp_millis().to_string(),
            time: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            ip: ip.to_string(),
            model: model.to_string(),
            duration: (duration_ms as f64 / 1000.0 * 1000.0).round() / 1000.0,
            status,
            key_masked: key_masked.to_string(),
            error: error.unwrap_or("").to_string(),
            stream,
        };

        let mut logs = self.logs.lock().await;
        logs.push_front(entry);
        let max_len = self.settings.max_len.max(1);
        while logs.len() > max_len {
            logs.pop_back();
        }
        drop(logs);
        self.debounce.mark();
    }

    /// Page of entries, newest first.
    pub async fn list(&self, limit: usize, offset: usize) -> serde_json::Value {
        let logs = self.logs.lock().await;
        let total = logs.len();
        let page: Vec<&LogEntry> = logs.iter().skip(offset).take(limit.max(1)).collect();
        json!({ "logs": page, "total": total })
    }

    pub async fn clear(&self) -> Result<()> {
        self.logs.lock().await.clear();
        self.debounce.take_dirty();
        self.save().await
    }
}
