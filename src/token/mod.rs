// Token module - session-cookie pool management
//
// A token is one upstream account's session cookie. Tokens live in named
// pools (capability tiers), carry a request-equivalent quota, and move
// through a small lifecycle: active, cooling (throttled or failing),
// disabled (forbidden) or expired (session invalid).

mod manager;
mod pool;

pub use manager::TokenManager;
pub use pool::{TokenPool, TokenPoolStats};

use serde::{Deserialize, Serialize};

/// Quota value meaning "unknown but available".
pub const QUOTA_UNKNOWN: i64 = -1;

/// Lifecycle state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Cooling,
    Disabled,
    Expired,
}

/// Categorical request cost. Low models burn 1 request-equivalent,
/// reasoning-heavy models burn 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    High,
}

impl Effort {
    pub fn cost(self) -> i64 {
        match self {
            Effort::Low => 1,
            Effort::High => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::High => "high",
        }
    }
}

/// One upstream account's session token and its pool-visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    /// Remaining request-equivalents; [`QUOTA_UNKNOWN`] until first observed
    pub quota: i64,
    pub status: TokenStatus,
    /// Epoch seconds when a time-based cooldown ends; 0 = none
    #[serde(default)]
    pub cooldown_until: f64,
    /// Count-based thaw: pool-wide requests left before re-activation
    #[serde(default)]
    pub cooldown_requests: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_used_at: f64,
}

impl TokenInfo {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            quota: QUOTA_UNKNOWN,
            status: TokenStatus::Active,
            cooldown_until: 0.0,
            cooldown_requests: 0,
            consecutive_failures: 0,
            last_used_at: 0.0,
        }
    }

    /// Active with quota remaining (or unknown).
    pub fn selectable(&self) -> bool {
        self.status == TokenStatus::Active && (self.quota > 0 || self.quota == QUOTA_UNKNOWN)
    }
}

/// Shorten a token value for log lines. Never log the full secret.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 10 {
        return token.to_string();
    }
    format!("{}...", &token[..10])
}

pub(crate) fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
