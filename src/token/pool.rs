// Per-pool token indexing and selection
//
// Selection policy: bucket selectable tokens by remaining quota, walk the
// non-empty quotas in descending order, and pick uniformly inside a bucket.
// Unknown quota (-1) sorts below every known quota, so it is tried last.
// Ties are broken randomly so concurrent replicas spread across tokens.

use super::{TokenInfo, TokenStatus, QUOTA_UNKNOWN};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Constant-time add/remove/random-pick bag of token values.
#[derive(Debug, Default)]
struct Bucket {
    items: Vec<String>,
    index: HashMap<String, usize>,
}

impl Bucket {
    fn add(&mut self, token: &str) {
        if self.index.contains_key(token) {
            return;
        }
        self.index.insert(token.to_string(), self.items.len());
        self.items.push(token.to_string());
    }

    /// Swap-to-last-and-pop removal.
    fn remove(&mut self, token: &str) {
        let Some(idx) = self.index.remove(token) else {
            return;
        };
        let last = self.items.pop().expect("index out of sync with items");
        if idx < self.items.len() {
            self.items[idx] = last.clone();
            self.index.insert(last, idx);
        }
    }

    fn pick(&self, exclude: &HashSet<String>) -> Option<&str> {
        if self.items.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        if exclude.is_empty() {
            return Some(&self.items[rng.gen_range(0..self.items.len())]);
        }
        // A few random probes first; the exclude set is usually tiny
        let tries = self.items.len().min(5);
        for _ in 0..tries {
            let candidate = &self.items[rng.gen_range(0..self.items.len())];
            if !exclude.contains(candidate) {
                return Some(candidate);
            }
        }
        self.items.iter().map(String::as_str).find(|t| !exclude.contains(*t))
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Aggregate counters for one pool, used by the admin surface.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TokenPoolStats {
    pub total: usize,
    pub active: usize,
    pub cooling: usize,
    pub disabled: usize,
    pub expired: usize,
    pub total_quota: i64,
    pub avg_quota: f64,
}

/// A named set of tokens with O(1) random selection among selectable members.
#[derive(Debug)]
pub struct TokenPool {
    name: String,
    tokens: HashMap<String, TokenInfo>,
    quota_buckets: HashMap<i64, Bucket>,
    non_empty_quotas: BTreeSet<i64>,
}

impl TokenPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tokens: HashMap::new(),
            quota_buckets: HashMap::new(),
            non_empty_quotas: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn index_add(&mut self, info: &TokenInfo) {
        if !info.selectable() {
            return;
        }
        self.quota_buckets
            .entry(info.quota)
            .or_default()
            .add(&info.token);
        self.non_empty_quotas.insert(info.quota);
    }

    fn index_remove(&mut self, token: &str, quota: i64, status: TokenStatus) {
        if status != TokenStatus::Active || (quota <= 0 && quota != QUOTA_UNKNOWN) {
            return;
        }
        if let Some(bucket) = self.quota_buckets.get_mut(&quota) {
            bucket.remove(token);
            if bucket.len() == 0 {
                self.non_empty_quotas.remove(&quota);
            }
        }
    }

    pub fn add(&mut self, info: TokenInfo) {
        if let Some(old) = self.tokens.get(&info.token) {
            let (quota, status) = (old.quota, old.status);
            self.index_remove(&info.token, quota, status);
        }
        self.index_add(&info);
        self.tokens.insert(info.token.clone(), info);
    }

    pub fn remove(&mut self, token: &str) -> bool {
        let Some(info) = self.tokens.remove(token) else {
            return false;
        };
        self.index_remove(token, info.quota, info.status);
        true
    }

    pub fn get(&self, token: &str) -> Option<&TokenInfo> {
        self.tokens.get(token)
    }

    /// Mutate a token and rebuild its index entry from the delta.
    pub fn update<F: FnOnce(&mut TokenInfo)>(&mut self, token: &str, f: F) -> bool {
        let Some(info) = self.tokens.get_mut(token) else {
            return false;
        };
        let (old_quota, old_status) = (info.quota, info.status);
        f(info);
        let snapshot = info.clone();
        self.index_remove(token, old_quota, old_status);
        self.index_add(&snapshot);
        true
    }

    /// Pick an active token with quota, preferring the fullest bucket.
    pub fn select(&self, exclude: &HashSet<String>) -> Option<TokenInfo> {
        // Descending quota order; QUOTA_UNKNOWN (-1) naturally lands last.
        for quota in self.non_empty_quotas.iter().rev() {
            let Some(bucket) = self.quota_buckets.get(quota) else {
                continue;
            };
            let Some(token) = bucket.pick(exclude) else {
                continue;
            };
            let Some(info) = self.tokens.get(token) else {
                continue;
            };
            if !info.selectable() {
                continue;
            }
            return Some(info.clone());
        }
        None
    }

    pub fn count(&self) -> usize {
        self.tokens.len()
    }

    pub fn list(&self) -> Vec<TokenInfo> {
        self.tokens.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenInfo> {
        self.tokens.values()
    }

    pub fn stats(&self) -> TokenPoolStats {
        let mut stats = TokenPoolStats {
            total: self.tokens.len(),
            ..Default::default()
        };
        for info in self.tokens.values() {
            if info.quota > 0 {
                stats.total_quota += info.quota;
            }
            match info.status {
                TokenStatus::Active => stats.active += 1,
                TokenStatus::Cooling => stats.cooling += 1,
                TokenStatus::Disabled => stats.disabled += 1,
                TokenStatus::Expired => stats.expired += 1,
            }
        }
        if stats.total > 0 {
            stats.avg_quota = stats.total_quota as f64 / stats.total as f64;
        }
        stats
    }

    /// Rebuild the quota index from scratch (after a bulk load).
    pub fn rebuild_index(&mut self) {
        self.quota_buckets.clear();
        self.non_empty_quotas.clear();
        let infos: Vec<TokenInfo> = self.tokens.values().cloned().collect();
        for info in infos {
            self.index_add(&info);
        }
    }
}
