// Error taxonomy for the gateway
//
// Every user-visible failure funnels through `AppError`, which renders an
// OpenAI-style `{"error": {"message", "type", "code"}}` body. Upstream
// failures keep their HTTP status and body so the retry orchestrator can
// classify them before they ever reach a client.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Failure reported by the upstream service (non-2xx or broken transport).
///
/// `remaining` carries `remainingTokens`/`remainingQueries` when the caller
/// already parsed them; otherwise `has_quota()` falls back to the body JSON.
#[derive(Debug, Clone, Error)]
#[error("upstream request failed: status {status}")]
pub struct UpstreamError {
    pub status: u16,
    pub body: String,
    pub code: Option<String>,
    pub remaining: Option<i64>,
}

impl UpstreamError {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            code: None,
            remaining: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Wrap a transport-level failure. HTTP/2 stream resets are tagged so the
    /// caller can distinguish a mid-stream connection loss from a clean error.
    pub fn transport(err: &dyn std::fmt::Display) -> Self {
        let text = err.to_string();
        let lower = text.to_lowercase();
        let code = if lower.contains("http2") || lower.contains("http/2") || lower.contains("stream")
        {
            "http2_stream_error"
        } else {
            "upstream_transport_error"
        };
        Self::new(502, text).with_code(code)
    }

    /// True when the upstream throttled the request.
    pub fn is_rate_limited(&self) -> bool {
        self.status == 429 || self.code.as_deref() == Some("rate_limit_exceeded")
    }

    /// Whether the token still has quota according to the upstream.
    ///
    /// Checks the pre-parsed `remaining` field first, then the body JSON for
    /// `remainingTokens`/`remainingQueries`. `None` when the upstream said
    /// nothing either way.
    pub fn has_quota(&self) -> Option<bool> {
        if let Some(remaining) = self.remaining {
            return Some(remaining > 0 || remaining == -1);
        }
        let payload: serde_json::Value = serde_json::from_str(&self.body).ok()?;
        for key in ["remainingTokens", "remainingQueries"] {
            if let Some(value) = payload.get(key).and_then(|v| v.as_i64()) {
                return Some(value > 0 || value == -1);
            }
        }
        None
    }
}

/// Which of the three stream timeout tiers expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTier {
    First,
    Idle,
    Total,
}

impl TimeoutTier {
    pub fn code(&self) -> &'static str {
        match self {
            TimeoutTier::First => "stream_first_timeout",
            TimeoutTier::Idle => "stream_idle_timeout",
            TimeoutTier::Total => "stream_total_timeout",
        }
    }
}

impl std::fmt::Display for TimeoutTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutTier::First => write!(f, "first response"),
            TimeoutTier::Idle => write!(f, "idle"),
            TimeoutTier::Total => write!(f, "total"),
        }
    }
}

/// Gateway error taxonomy. Variants map one-to-one onto client statuses.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("No available tokens. Please try again later.")]
    TokensExhausted,

    #[error("Stream {tier} timeout after {seconds}s")]
    StreamTimeout { tier: TimeoutTier, seconds: u64 },

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream(e) => {
                StatusCode::from_u16(e.status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::TokensExhausted => StatusCode::TOO_MANY_REQUESTS,
            AppError::StreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style error `type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "invalid_request_error",
            AppError::Auth(_) => "authentication_error",
            AppError::Upstream(_) => "upstream_error",
            AppError::TokensExhausted => "rate_limit_error",
            AppError::StreamTimeout { .. } => "timeout_error",
            AppError::CircuitOpen => "service_unavailable",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// OpenAI-style error `code` field, when one applies.
    pub fn error_code(&self) -> Option<String> {
        match self {
            AppError::Upstream(e) => e.code.clone(),
            AppError::TokensExhausted => Some("rate_limit_exceeded".to_string()),
            AppError::StreamTimeout { tier, .. } => Some(tier.code().to_string()),
            AppError::CircuitOpen => Some("circuit_breaker_open".to_string()),
            _ => None,
        }
    }

    /// Render the error body without consuming the error.
    pub fn to_body(&self) -> serde_json::Value {
        let message = match self {
            // Never leak internal details to clients
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": self.error_code(),
            }
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {} - {}", status, self);
        } else {
            tracing::debug!("request rejected: {} - {}", status, self);
        }

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");
        if matches!(self, AppError::Auth(_)) {
            builder = builder.header(header::WWW_AUTHENTICATE, "Bearer");
        }

        builder
            .body(Body::from(self.to_body().to_string()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
