// Request statistics - hourly/daily buckets plus per-model counters
//
// Buckets are keyed by local wall-clock ("2026-08-01T14" / "2026-08-01");
// retention is capped so the document cannot grow without bound. Persisted
// as `stats.json` through the shared debounced-writer pattern.

use crate::config::StatsSettings;
use crate::persist::Debounce;
use crate::storage::Storage;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Periodic in-band cleanup: every N records, trim old buckets.
const CLEANUP_EVERY: u64 = 100;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

struct Inner {
    hourly: HashMap<String, Bucket>,
    daily: HashMap<String, Bucket>,
    models: HashMap<String, u64>,
    records_since_cleanup: u64,
}

pub struct RequestStats {
    inner: Mutex<Inner>,
    storage: Arc<dyn Storage>,
    settings: StatsSettings,
    debounce: Arc<Debounce>,
}

impl RequestStats {
    pub fn new(storage: Arc<dyn Storage>, settings: StatsSettings) -> Arc<Self> {
        let debounce = Debounce::new(settings.save_delay_ms);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                hourly: HashMap::new(),
                daily: HashMap::new(),
                models: HashMap::new(),
                records_since_cleanup: 0,
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
        let doc = self.storage.load_json("stats.json").await?;
        let mut inner = self.inner.lock().await;
        if let Some(doc) = doc {
            inner.hourly = serde_json::from_value(doc.get("hourly").cloned().unwrap_or(json!({})))
                .unwrap_or_default();
            inner.daily = serde_json::from_value(doc.get("daily").cloned().unwrap_or(json!({})))
                .unwrap_or_default();
            inner.models = serde_json::from_value(doc.get("models").cloned().unwrap_or(json!({})))
                .unwrap_or_default();
        }
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let doc = {
            let inner = self.inner.lock().await;
            json!({
                "hourly": inner.hourly,
                "daily": inner.daily,
                "models": inner.models,
            })
        };
        self.storage.save_json("stats.json", &doc).await
    }

    pub async fn flush(&self) -> Result<()> {
        if self.debounce.take_dirty() {
            self.save().await?;
        }
        Ok(())
    }

    fn trim(&self, inner: &mut Inner) {
        let trim_map = |map: &mut HashMap<String, Bucket>, keep: usize| {
            if map.len() <= keep {
                return;
            }
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            let drop_count = keys.len() - keep;
            for key in keys.into_iter().take(drop_count) {
                map.remove(&key);
            }
        };
        trim_map(&mut inner.hourly, self.settings.hourly_keep.max(1));
        trim_map(&mut inner.daily, self.settings.daily_keep.max(1));
    }

    pub async fn record(&self, model: &str, success: bool) {
        let now = Local::now();
        let hour_key = now.format("%Y-%m-%dT%H").to_string();
        let day_key = now.format("%Y-%m-%d").to_string();

        fn bump(bucket: &mut Bucket, success: bool) {
            bucket.total += 1;
            if success {
                bucket.success += 1;
            } else {
                bucket.failed += 1;
            }
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        bump(inner.hourly.entry(hour_key).or_default(), success);
        bump(inner.daily.entry(day_key).or_default(), success);
        if !model.is_empty() {
            *inner.models.entry(model.to_string()).or_default() += 1;
        }

        inner.records_since_cleanup += 1;
        if inner.records_since_cleanup >= CLEANUP_EVERY {
            inner.records_since_cleanup = 0;
            self.trim(inner);
        }
        drop(guard);
        self.debounce.mark();
    }

    /// Dashboard view: the last `hours`/`days` buckets (empty ones included)
    /// plus top models and an overall summary.
    pub async fn snapshot(&self, hours: i64, days: i64) -> Value {
        let inner = self.inner.lock().await;
        let now = Local::now();

        let hourly: Vec<Value> = (0..hours)
            .rev()
            .map(|i| {
                let at = now - ChronoDuration::hours(i);
                let key = at.format("%Y-%m-%dT%H").to_string();
                let bucket = inner.hourly.get(&key).cloned().unwrap_or_default();
                json!({
                    "hour": at.format("%H:00").to_string(),
                    "date": at.format("%m-%d").to_string(),
                    "total": bucket.total,
                    "success": bucket.success,
                    "failed": bucket.failed,
                })
            })
            .collect();

        let daily: Vec<Value> = (0..days)
            .rev()
            .map(|i| {
                let at = now - ChronoDuration::days(i);
                let key = at.format("%Y-%m-%d").to_string();
                let bucket = inner.daily.get(&key).cloned().unwrap_or_default();
                json!({
                    "date": at.format("%m-%d").to_string(),
                    "total": bucket.total,
                    "success": bucket.success,
                    "failed": bucket.failed,
                })
            })
            .collect();

        let mut models: Vec<(&String, &u64)> = inner.models.iter().collect();
        models.sort_by(|a, b| b.1.cmp(a.1));
        let models: Vec<Value> = models
            .into_iter()
            .take(10)
            .map(|(model, count)| json!({"model": model, "count": count}))
            .collect();

        let total: u64 = inner.hourly.values().map(|b| b.total).sum();
        let success: u64 = inner.hourly.values().map(|b| b.success).sum();
        let failed: u64 = inner.hourly.values().map(|b| b.failed).sum();
        let success_rate = if total > 0 {
            (success as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        json!({
            "hourly": hourly,
            "daily": daily,
            "models": models,
            "summary": {
                "total": total,
                "success": success,
                "failed": failed,
                "success_rate": success_rate,
            },
        })
    }

    pub async fn reset(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.hourly.clear();
            inner.daily.clear();
            inner.models.clear();
        }
        self.debounce.take_dirty();
        self.save().await
    }
}
