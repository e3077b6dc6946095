// Proxy pool - static egress settings plus optional dynamic rotation
//
// When a pool URL is configured, the current egress proxy is fetched from it
// and cached; the cache refreshes on a schedule and on demand when the
// upstream starts answering 403 (IP block). Pool endpoints answer in several
// shapes: a bare `ip:port`, a full proxy URL, or a JSON payload with the
// proxy buried under one of a handful of common keys.

use crate::config::ProxySettings;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct CachedProxy {
    current: Option<String>,
    last_refresh: Option<Instant>,
}

pub struct ProxyPool {
    settings: ProxySettings,
    cache: Mutex<CachedProxy>,
    client: reqwest::Client,
}

impl ProxyPool {
    pub fn new(settings: ProxySettings) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build proxy pool client");
        Arc::new(Self {
            settings,
            cache: Mutex::new(CachedProxy {
                current: None,
                last_refresh: None,
            }),
            client,
        })
    }

    /// Normalize a candidate into `scheme://host:port`, defaulting to http.
    fn normalize(value: &str) -> Option<String> {
        let candidate = value.trim().lines().next()?.trim();
        if candidate.is_empty() {
            return None;
        }
        let candidate = if candidate.contains("//") {
            candidate.to_string()
        } else {
            format!("http://{candidate}")
        };
        const SCHEMES: [&str; 6] = [
            "http://",
            "https://",
            "socks5://",
            "socks5h://",
            "socks4://",
            "socks4a://",
        ];
        if SCHEMES.iter().any(|s| candidate.starts_with(s)) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Dig a proxy out of whatever shape the pool endpoint returned.
    fn extract(payload: &Value) -> Option<String> {
        match payload {
            Value::String(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                if let Some(normalized) = Self::normalize(text) {
                    return Some(normalized);
                }
                let decoded: Value = serde_json::from_str(text).ok()?;
                Self::extract(&decoded)
            }
            Value::Array(items) => items.iter().find_map(Self::extract),
            Value::Object(map) => {
                for key in [
                    "proxy", "proxy_url", "url", "http", "https", "result", "data", "ip",
                ] {
                    if let Some(found) = map.get(key).and_then(Self::extract) {
                        return Some(found);
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.settings.pool_refresh_sec.max(1))
    }

    fn is_stale(&self, cache: &CachedProxy) -> bool {
        if cache.current.is_none() {
            return true;
        }
        match cache.last_refresh {
            Some(at) => at.elapsed() >= self.refresh_interval(),
            None => true,
        }
    }

    async fn fetch_pool_proxy(&self) -> Option<String> {
        let pool_url = &self.settings.pool_url;
        let response = match self.client.get(pool_url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("proxy pool fetch error: {e}");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::warn!("proxy pool fetch failed: status={}", response.status());
            return None;
        }
        let text = response.text().await.ok()?;
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Self::extract(&Value::String(text.to_string())).or_else(|| Self::normalize(text))
    }

    /// Refresh the cached dynamic proxy. On failure the previous proxy is
    /// kept; a pool that momentarily misbehaves must not drop the egress.
    pub async fn refresh(&self, force: bool) -> Option<String> {
        if self.settings.pool_url.is_empty() {
            return None;
        }

        let mut cache = self.cache.lock().await;
        if !force && !self.is_stale(&cache) {
            return cache.current.clone();
        }

        let fetched = self.fetch_pool_proxy().await;
        cache.last_refresh = Some(Instant::now());
        match fetched {
            Some(proxy) => {
                if cache.current.as_deref() != Some(proxy.as_str()) {
                    tracing::info!("proxy pool switched egress: {proxy}");
                }
                cache.current = Some(proxy);
            }
            None => {
                tracing::warn!("proxy pool returned no valid proxy; keeping previous egress");
            }
        }
        cache.current.clone()
    }

    /// Current egress proxy for a request, or `None` for a direct connection.
    ///
    /// Asset fetches prefer the dedicated asset proxy when configured; chat
    /// requests use the dynamic pool when one is set, else the static base.
    pub async fn get(&self, for_asset: bool) -> Option<String> {
        if for_asset && !self.settings.asset_proxy_url.is_empty() {
            return Some(self.settings.asset_proxy_url.clone());
        }

        let static_proxy = if self.settings.base_proxy_url.is_empty() {
            None
        } else {
            Some(self.settings.base_proxy_url.clone())
        };

        if self.settings.pool_url.is_empty() {
            return static_proxy;
        }

        let stale = {
            let cache = self.cache.lock().await;
            self.is_stale(&cache)
        };
        if stale {
            self.refresh(false).await;
        }

        let cache = self.cache.lock().await;
        cache.current.clone().or(static_proxy)
    }

    /// How many attempts a 403-rotation loop gets: one without a pool,
    /// `pool_403_max` with one.
    pub fn rotation_attempts(&self) -> u32 {
        if self.settings.pool_url.is_empty() {
            1
        } else {
            self.settings.pool_403_max.max(1)
        }
    }

    /// Background refresh loop; only started when a pool URL is configured.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.settings.pool_url.is_empty() {
            return None;
        }
        let pool = self.clone();
        Some(tokio::spawn(async move {
            pool.refresh(true).await;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.refresh_interval()) => {}
                    _ = shutdown.changed() => break,
                }
                pool.refresh(true).await;
            }
        }))
    }
}
