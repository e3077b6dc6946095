// Token manager - pool set, cooldown policy, quota accounting, persistence
//
// Cooldown policy on upstream failure:
// - 429 with quota remaining (or unknown): time-based cooldown,
//   `cooldown_429_quota_sec`.
// - 429 with quota exhausted: time-based cooldown, `cooldown_429_empty_sec`.
// - other non-auth failures: after `fail_threshold` consecutive failures the
//   token cools for `cooldown_error_requests` pool-wide requests (count-based
//   thaw, ticked on every select against the pool).
// - 401/403: the session is invalid or forbidden; the token leaves rotation
//   permanently (Expired / Disabled) and is never retried automatically.

use super::{now_epoch, Effort, TokenInfo, TokenPool, TokenPoolStats, TokenStatus, QUOTA_UNKNOWN};
use crate::config::TokenSettings;
use crate::persist::Debounce;
use crate::storage::Storage;
use anyhow::Result;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// How often the background probe re-examines cooling tokens.
const COOLDOWN_PROBE_INTERVAL: Duration = Duration::from_secs(60);

struct Inner {
    pools: HashMap<String, TokenPool>,
    /// token value -> owning pool. A token lives in at most one pool.
    pool_of: HashMap<String, String>,
    last_reload: Option<Instant>,
}

/// Owns token lifecycle across all pools and persists it as `tokens.json`.
pub struct TokenManager {
    inner: Mutex<Inner>,
    storage: Arc<dyn Storage>,
    settings: TokenSettings,
    debounce: Arc<Debounce>,
}

impl TokenManager {
    pub fn new(storage: Arc<dyn Storage>, settings: TokenSettings) -> Arc<Self> {
        let debounce = Debounce::new(settings.save_delay_ms);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pools: HashMap::new(),
                pool_of: HashMap::new(),
                last_reload: None,
            }),
            storage,
            settings,
            debounce,
        })
    }

    pub fn debounce(&self) -> Arc<Debounce> {
        self.debounce.clone()
    }

    /// Load `tokens.json` and rebuild all indexes.
    pub async fn load(&self) -> Result<()> {
        let doc = self.storage.load_json("tokens.json").await?;
        let mut inner = self.inner.lock().await;
        inner.pools.clear();
        inner.pool_of.clear();

        if let Some(pools) = doc.as_ref().and_then(|d| d.get("pools")).and_then(|p| p.as_object())
        {
            for (name, tokens) in pools {
                let mut pool = TokenPool::new(name.clone());
                if let Some(entries) = tokens.as_array() {
                    for entry in entries {
                        match serde_json::from_value::<TokenInfo>(entry.clone()) {
                            Ok(info) => {
                                inner.pool_of.insert(info.token.clone(), name.clone());
                                pool.add(info);
                            }
                            Err(e) => tracing::warn!("skipping malformed token entry: {e}"),
                        }
                    }
                }
                tracing::debug!("loaded pool {}: {} tokens", pool.name(), pool.count());
                inner.pools.insert(name.clone(), pool);
            }
        }

        inner.last_reload = Some(Instant::now());
        let total: usize = inner.pools.values().map(|p| p.count()).sum();
        tracing::info!(
            "token manager loaded: {} tokens across {} pools",
            total,
            inner.pools.len()
        );
        Ok(())
    }

    /// Serialize every pool back to storage.
    pub async fn save(&self) -> Result<()> {
        let doc = {
            let inner = self.inner.lock().await;
            let mut pools = serde_json::Map::new();
            for (name, pool) in &inner.pools {
                pools.insert(name.clone(), serde_json::to_value(pool.list())?);
            }
            json!({ "pools": pools })
        };
        self.storage.save_json("tokens.json", &doc).await
    }

    /// Flush pending state immediately (shutdown path).
    pub async fn flush(&self) -> Result<()> {
        if self.debounce.take_dirty() {
            self.save().await?;
        }
        Ok(())
    }

    /// Reload from storage when the in-memory copy is older than the
    /// reconcile interval. Dirty local state is flushed first so replicas
    /// converge through the store instead of overwriting each other blindly.
    pub async fn reload_if_stale(&self) {
        let stale = {
            let inner = self.inner.lock().await;
            match inner.last_reload {
                Some(at) => at.elapsed() >= Duration::from_secs(self.settings.reload_interval_sec),
                None => true,
            }
        };
        if !stale {
            return;
        }
        if self.debounce.take_dirty() {
            if let Err(e) = self.save().await {
                tracing::error!("failed to flush tokens before reload: {e:#}");
            }
        }
        if let Err(e) = self.load().await {
            tracing::error!("failed to reload tokens: {e:#}");
        }
    }

    /// Add a token to a pool. A token already registered elsewhere moves.
    pub async fn add(&self, pool_name: &str, token: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.pool_of.get(token).cloned() {
            if let Some(pool) = inner.pools.get_mut(&previous) {
                pool.remove(token);
            }
        }
        inner
            .pools
            .entry(pool_name.to_string())
            .or_insert_with(|| TokenPool::new(pool_name))
            .add(TokenInfo::new(token));
        inner
            .pool_of
            .insert(token.to_string(), pool_name.to_string());
        drop(inner);
        self.debounce.mark();
    }

    pub async fn remove(&self, token: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(pool_name) = inner.pool_of.remove(token) else {
            return false;
        };
        let removed = inner
            .pools
            .get_mut(&pool_name)
            .map(|p| p.remove(token))
            .unwrap_or(false);
        drop(inner);
        if removed {
            self.debounce.mark();
        }
        removed
    }

    pub async fn get(&self, token: &str) -> Option<TokenInfo> {
        let inner = self.inner.lock().await;
        let pool_name = inner.pool_of.get(token)?;
        inner.pools.get(pool_name)?.get(token).cloned()
    }

    pub async fn pool_of(&self, token: &str) -> Option<String> {
        self.inner.lock().await.pool_of.get(token).cloned()
    }

    /// Select a token from a pool. Every call is one pool-wide request tick:
    /// count-based cooldowns decrement here and thaw at zero.
    pub async fn select(&self, pool_name: &str, exclude: &HashSet<String>) -> Option<TokenInfo> {
        let mut inner = self.inner.lock().await;
        let pool = inner.pools.get_mut(pool_name)?;

        let ticking: Vec<String> = pool
            .iter()
            .filter(|t| t.status == TokenStatus::Cooling && t.cooldown_requests > 0)
            .map(|t| t.token.clone())
            .collect();
        for token in &ticking {
            pool.update(token, |info| {
                info.cooldown_requests = info.cooldown_requests.saturating_sub(1);
                if info.cooldown_requests == 0 {
                    info.status = TokenStatus::Active;
                    info.cooldown_until = 0.0;
                }
            });
        }
        let selected = pool.select(exclude);
        drop(inner);
        if !ticking.is_empty() {
            self.debounce.mark();
        }
        selected
    }

    /// Cool a token after a recoverable upstream failure.
    ///
    /// `has_quota` is the upstream's own verdict; when it said nothing the
    /// token's local quota decides.
    pub async fn apply_cooldown(
        &self,
        token: &str,
        status: u16,
        has_quota: Option<bool>,
        reason: &str,
    ) {
        let now = now_epoch();
        let settings = self.settings.clone();
        let mut cooled: Option<(TokenStatus, f64, u32)> = None;

        {
            let mut inner = self.inner.lock().await;
            let Some(pool_name) = inner.pool_of.get(token).cloned() else {
                return;
            };
            let Some(pool) = inner.pools.get_mut(&pool_name) else {
                return;
            };
            pool.update(token, |info| {
                if status == 429 {
                    let has = has_quota
                        .unwrap_or(info.quota > 0 || info.quota == QUOTA_UNKNOWN);
                    let secs = if has {
                        settings.cooldown_429_quota_sec
                    } else {
                        settings.cooldown_429_empty_sec
                    };
                    info.status = TokenStatus::Cooling;
                    info.cooldown_until = now + secs as f64;
                    info.cooldown_requests = 0;
                } else {
                    info.consecutive_failures += 1;
                    if info.consecutive_failures >= settings.fail_threshold {
                        info.status = TokenStatus::Cooling;
                        info.cooldown_requests = settings.cooldown_error_requests;
                        info.cooldown_until = 0.0;
                        info.consecutive_failures = 0;
                    }
                }
                cooled = Some((info.status, info.cooldown_until, info.cooldown_requests));
            });
        }

        if let Some((new_status, until, requests)) = cooled {
            tracing::warn!(
                "token {} cooldown applied: status={status} reason={reason} -> {:?} (until={until:.0}, requests={requests})",
                super::mask_token(token),
                new_status,
            );
            self.debounce.mark();
        }
    }

    /// Record an auth failure. 401 means the session is dead, 403 means the
    /// account is blocked; neither comes back without operator action.
    pub async fn record_failure(&self, token: &str, status: u16, reason: &str) {
        let mut inner = self.inner.lock().await;
        let Some(pool_name) = inner.pool_of.get(token).cloned() else {
            return;
        };
        let Some(pool) = inner.pools.get_mut(&pool_name) else {
            return;
        };
        pool.update(token, |info| match status {
            401 => info.status = TokenStatus::Expired,
            403 => info.status = TokenStatus::Disabled,
            _ => info.consecutive_failures += 1,
        });
        drop(inner);
        tracing::warn!(
            "token {} failure recorded: status={status} reason={reason}",
            super::mask_token(token)
        );
        self.debounce.mark();
    }

    /// Burn quota for a completed request.
    pub async fn consume(&self, token: &str, effort: Effort) {
        let now = now_epoch();
        let mut inner = self.inner.lock().await;
        let Some(pool_name) = inner.pool_of.get(token).cloned() else {
            return;
        };
        let Some(pool) = inner.pools.get_mut(&pool_name) else {
            return;
        };
        pool.update(token, |info| {
            if info.quota > 0 {
                info.quota = (info.quota - effort.cost()).max(0);
            }
            info.last_used_at = now;
            info.consecutive_failures = 0;
        });
        drop(inner);
        self.debounce.mark();
    }

    /// Flip time-based cooldowns that have run out back to Active.
    /// Returns how many tokens recovered.
    pub async fn refresh_cooling(&self) -> usize {
        let now = now_epoch();
        let mut recovered = 0;
        {
            let mut inner = self.inner.lock().await;
            for pool in inner.pools.values_mut() {
                let expired: Vec<String> = pool
                    .iter()
                    .filter(|t| {
                        t.status == TokenStatus::Cooling
                            && t.cooldown_until > 0.0
                            && now >= t.cooldown_until
                    })
                    .map(|t| t.token.clone())
                    .collect();
                for token in &expired {
                    pool.update(token, |info| {
                        info.status = TokenStatus::Active;
                        info.cooldown_until = 0.0;
                        info.cooldown_requests = 0;
                    });
                }
                recovered += expired.len();
            }
        }
        if recovered > 0 {
            tracing::info!("cooldown probe recovered {recovered} tokens");
            self.debounce.mark();
        }
        recovered
    }

    pub async fn list(&self, pool_name: &str) -> Vec<TokenInfo> {
        let inner = self.inner.lock().await;
        inner
            .pools
            .get(pool_name)
            .map(|p| p.list())
            .unwrap_or_default()
    }

    pub async fn list_all(&self) -> HashMap<String, Vec<TokenInfo>> {
        let inner = self.inner.lock().await;
        inner
            .pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.list()))
            .collect()
    }

    pub async fn stats(&self) -> HashMap<String, TokenPoolStats> {
        let inner = self.inner.lock().await;
        inner
            .pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Periodic probe that promotes expired cooldowns back to Active.
    pub fn spawn_cooldown_probe(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(COOLDOWN_PROBE_INTERVAL) => {}
                    _ = shutdown.changed() => break,
                }
                manager.refresh_cooling().await;
            }
        })
    }

    #[cfg(test)]
    pub(crate) async fn force_cooldown_until(&self, token: &str, until: f64) {
        let mut inner = self.inner.lock().await;
        let pool_name = inner.pool_of.get(token).cloned().unwrap();
        inner
            .pools
            .get_mut(&pool_name)
            .unwrap()
            .update(token, |info| info.cooldown_until = until);
    }

    #[cfg(test)]
    pub(crate) async fn force_quota(&self, token: &str, quota: i64) {
        let mut inner = self.inner.lock().await;
        let pool_name = inner.pool_of.get(token).cloned().unwrap();
        inner
            .pools
            .get_mut(&pool_name)
            .unwrap()
            .update(token, |info| info.quota = quota);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    async fn manager() -> (Arc<TokenManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()).unwrap());
        let mgr = TokenManager::new(storage, TokenSettings::default());
        (mgr, dir)
    }

    #[tokio::test]
    async fn consume_is_monotonic_and_clamped() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;
        mgr.force_quota("t1", 6).await;

        mgr.consume("t1", Effort::Low).await;
        assert_eq!(mgr.get("t1").await.unwrap().quota, 5);

        mgr.consume("t1", Effort::High).await;
        assert_eq!(mgr.get("t1").await.unwrap().quota, 1);

        mgr.consume("t1", Effort::High).await;
        assert_eq!(mgr.get("t1").await.unwrap().quota, 0);
    }

    #[tokio::test]
    async fn consume_leaves_unknown_quota_unknown() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;
        mgr.consume("t1", Effort::High).await;
        assert_eq!(mgr.get("t1").await.unwrap().quota, QUOTA_UNKNOWN);
    }

    #[tokio::test]
    async fn cooldown_429_with_quota_uses_short_window() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;
        mgr.force_quota("t1", 10).await;

        let before = now_epoch();
        mgr.apply_cooldown("t1", 429, Some(true), "rate_limit").await;

        let info = mgr.get("t1").await.unwrap();
        assert_eq!(info.status, TokenStatus::Cooling);
        let expected = before + TokenSettings::default().cooldown_429_quota_sec as f64;
        assert!((info.cooldown_until - expected).abs() < 5.0);
    }

    #[tokio::test]
    async fn cooldown_429_without_quota_uses_long_window() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;

        let before = now_epoch();
        mgr.apply_cooldown("t1", 429, Some(false), "rate_limit").await;

        let info = mgr.get("t1").await.unwrap();
        let expected = before + TokenSettings::default().cooldown_429_empty_sec as f64;
        assert!((info.cooldown_until - expected).abs() < 5.0);
    }

    #[tokio::test]
    async fn error_cooldown_triggers_after_threshold_and_thaws_by_requests() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;
        mgr.force_quota("t1", 10).await;

        // Below the threshold the token keeps serving
        for _ in 0..4 {
            mgr.apply_cooldown("t1", 502, None, "status_502").await;
            assert_eq!(mgr.get("t1").await.unwrap().status, TokenStatus::Active);
        }
        mgr.apply_cooldown("t1", 502, None, "status_502").await;

        let info = mgr.get("t1").await.unwrap();
        assert_eq!(info.status, TokenStatus::Cooling);
        assert_eq!(info.cooldown_requests, 5);

        // Four more pool-wide requests tick the counter down
        for _ in 0..4 {
            assert!(mgr.select("ssoBasic", &HashSet::new()).await.is_none());
        }
        // The fifth tick reaches zero and re-activates the token
        let picked = mgr.select("ssoBasic", &HashSet::new()).await.unwrap();
        assert_eq!(picked.token, "t1");
        assert_eq!(mgr.get("t1").await.unwrap().status, TokenStatus::Active);
    }

    #[tokio::test]
    async fn refresh_cooling_respects_deadline() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;
        mgr.apply_cooldown("t1", 429, Some(true), "rate_limit").await;

        // Deadline in the future: nothing recovers
        assert_eq!(mgr.refresh_cooling().await, 0);
        assert_eq!(mgr.get("t1").await.unwrap().status, TokenStatus::Cooling);

        // Move the deadline into the past
        mgr.force_cooldown_until("t1", now_epoch() - 1.0).await;
        assert_eq!(mgr.refresh_cooling().await, 1);
        assert_eq!(mgr.get("t1").await.unwrap().status, TokenStatus::Active);
    }

    #[tokio::test]
    async fn auth_failures_take_token_out_of_rotation() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;
        mgr.add("ssoBasic", "t2").await;

        mgr.record_failure("t1", 401, "auth_failed").await;
        assert_eq!(mgr.get("t1").await.unwrap().status, TokenStatus::Expired);

        mgr.record_failure("t2", 403, "forbidden").await;
        assert_eq!(mgr.get("t2").await.unwrap().status, TokenStatus::Disabled);

        assert!(mgr.select("ssoBasic", &HashSet::new()).await.is_none());
    }

    #[tokio::test]
    async fn token_moves_between_pools() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;
        mgr.add("ssoSuper", "t1").await;

        assert_eq!(mgr.pool_of("t1").await.as_deref(), Some("ssoSuper"));
        assert!(mgr.list("ssoBasic").await.is_empty());
        assert_eq!(mgr.list("ssoSuper").await.len(), 1);
    }

    #[tokio::test]
    async fn select_excludes_tried_tokens() {
        let (mgr, _dir) = manager().await;
        mgr.add("ssoBasic", "t1").await;
        mgr.add("ssoBasic", "t2").await;

        let exclude: HashSet<String> = ["t1".to_string()].into();
        for _ in 0..10 {
            let picked = mgr.select("ssoBasic", &exclude).await.unwrap();
            assert_eq!(picked.token, "t2");
        }
    }

    #[tokio::test]
    async fn state_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()).unwrap());

        let mgr = TokenManager::new(storage.clone(), TokenSettings::default());
        mgr.add("ssoBasic", "t1").await;
        mgr.force_quota("t1", 42).await;
        mgr.save().await.unwrap();

        let fresh = TokenManager::new(storage, TokenSettings::default());
        fresh.load().await.unwrap();
        let info = fresh.get("t1").await.unwrap();
        assert_eq!(info.quota, 42);
        assert_eq!(fresh.pool_of("t1").await.as_deref(), Some("ssoBasic"));
    }
}
