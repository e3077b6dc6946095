// Circuit breaker for the named upstream
//
// State machine:
// - CLOSED: calls pass; `failure_threshold` consecutive failures open it.
// - OPEN: calls are rejected outright until `cooldown_seconds` elapse.
// - HALF_OPEN: up to `half_open_max_calls` probes are admitted;
//   `success_threshold` consecutive successes close the breaker, any
//   failure reopens it.

use crate::config::BreakerSettings;
use crate::error::AppError;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
// tokio's Instant tracks the (pausable) tokio clock, keeping cooldown logic
// testable with time control
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Stats {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_state_change: Instant,
    total_rejected: u64,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    stats: Mutex<Stats>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            stats: Mutex::new(Stats {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_state_change: Instant::now(),
                total_rejected: 0,
            }),
        }
    }

    fn transition(&self, stats: &mut Stats, to: CircuitState) {
        tracing::warn!("circuit breaker '{}' -> {:?}", self.name, to);
        stats.state = to;
        stats.failure_count = 0;
        stats.success_count = 0;
        stats.half_open_calls = 0;
        stats.last_state_change = Instant::now();
    }

    /// Run a call through the breaker, enforcing the per-call timeout.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let mut stats = self.stats.lock().await;
            match stats.state {
                CircuitState::Open => {
                    let cooled = stats.last_state_change.elapsed()
                        >= Duration::from_secs(self.settings.cooldown_seconds);
                    if cooled {
                        self.transition(&mut stats, CircuitState::HalfOpen);
                        stats.half_open_calls = 1;
                    } else {
                        stats.total_rejected += 1;
                        return Err(AppError::CircuitOpen);
                    }
                }
                CircuitState::HalfOpen => {
                    if stats.half_open_calls >= self.settings.half_open_max_calls {
                        stats.total_rejected += 1;
                        return Err(AppError::CircuitOpen);
                    }
                    stats.half_open_calls += 1;
                }
                CircuitState::Closed => {}
            }
        }

        let timeout = Duration::from_secs(self.settings.call_timeout_sec.max(1));
        let outcome = match tokio::time::timeout(timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal(anyhow::anyhow!(
                "breaker call timed out after {}s",
                timeout.as_secs()
            ))),
        };

        match &outcome {
            Ok(_) => self.on_success().await,
            Err(_) => self.on_failure().await,
        }
        outcome
    }

    async fn on_success(&self) {
        let mut stats = self.stats.lock().await;
        match stats.state {
            CircuitState::HalfOpen => {
                stats.success_count += 1;
                if stats.success_count >= self.settings.success_threshold {
                    self.transition(&mut stats, CircuitState::Closed);
                }
            }
            CircuitState::Closed => stats.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut stats = self.stats.lock().await;
        match stats.state {
            CircuitState::HalfOpen => self.transition(&mut stats, CircuitState::Open),
            CircuitState::Closed => {
                stats.failure_count += 1;
                if stats.failure_count >= self.settings.failure_threshold {
                    self.transition(&mut stats, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.stats.lock().await.state
    }

    pub async fn snapshot(&self) -> serde_json::Value {
        let stats = self.stats.lock().await;
        serde_json::json!({
            "name": self.name,
            "state": stats.state,
            "failure_count": stats.failure_count,
            "success_count": stats.success_count,
            "total_rejected": stats.total_rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            enabled: true,
            failure_threshold: 3,
            success_threshold: 2,
            call_timeout_sec: 5,
            cooldown_seconds: 60,
            half_open_max_calls: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), AppError> {
        breaker
            .call(|| async { Err::<(), _>(AppError::Validation("boom".to_string())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), AppError> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("upstream", settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Open rejects without running the call
        let err = succeed(&breaker).await.unwrap_err();
        assert!(matches!(err, AppError::CircuitOpen));
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("upstream", settings());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probes_then_closes() {
        let breaker = CircuitBreaker::new("upstream", settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("upstream", settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }
}
