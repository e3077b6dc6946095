// Authentication - bearer allowlist and signed session cookies
//
// Session cookies are `base64url(payload).base64url(hmac_sha256(secret,
// payload_b64))` with payload `{sub, iat, exp, v}`. The HMAC key comes from
// SESSION_SECRET / app.session_secret and is never derived from the admin
// password. Cookie TTL is clamped to at least ten minutes. All secret
// comparisons run in constant time.

use crate::api_keys::ApiKeyManager;
use crate::config::Config;
use crate::error::AppError;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const ADMIN_SESSION_COOKIE: &str = "grokgate_admin_session";
pub const PUBLIC_SESSION_COOKIE: &str = "grokgate_public_session";

/// Minimum session lifetime regardless of configuration.
const MIN_SESSION_TTL_SECS: i64 = 600;

/// Constant-time string equality; empty values never match.
pub fn constant_time_eq(left: &str, right: &str) -> bool {
    if left.is_empty() || right.is_empty() || left.len() != right.len() {
        return false;
    }
    left.bytes()
        .zip(right.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn sign(secret: &str, payload_b64: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload_b64.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Build a signed session token for `subject` ("admin" or "public").
pub fn build_session_token(secret: &str, subject: &str, ttl_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let payload = json!({
        "sub": subject,
        "iat": now,
        "exp": now + ttl_secs.max(MIN_SESSION_TTL_SECS),
        "v": 1,
    });
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string());
    let signature = sign(secret, &payload_b64);
    format!("{payload_b64}.{signature}")
}

/// Verify a session token's signature, subject and validity window.
pub fn decode_session_token(secret: &str, token: &str, expected_subject: &str) -> Option<Value> {
    let (payload_b64, signature) = token.split_once('.')?;
    if !constant_time_eq(signature, &sign(secret, payload_b64)) {
        return None;
    }

    let payload_raw = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let payload: Value = serde_json::from_slice(&payload_raw).ok()?;
    if payload.get("sub").and_then(|v| v.as_str()) != Some(expected_subject) {
        return None;
    }

    let now = chrono::Utc::now().timestamp();
    let exp = payload.get("exp").and_then(|v| v.as_i64()).unwrap_or(0);
    let iat = payload.get("iat").and_then(|v| v.as_i64()).unwrap_or(0);
    if exp <= now || iat > now + 60 {
        return None;
    }
    Some(payload)
}

// ─────────────────────────────────────────────────────────────────────────────
// Request helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Bearer token from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Named cookie from the Cookie header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get("cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Whether the original request arrived over HTTPS, honoring proxies.
pub fn request_is_secure(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("https")
        })
        .unwrap_or(false)
}

/// Set-Cookie value for a session cookie.
pub fn session_cookie(name: &str, token: &str, max_age_secs: i64, secure: bool) -> String {
    let mut cookie =
        format!("{name}={token}; Max-Age={max_age_secs}; Path=/; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Set-Cookie value that clears a session cookie.
pub fn clear_cookie(name: &str) -> String {
    format!("{name}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax")
}

fn has_valid_session(config: &Config, headers: &HeaderMap, cookie: &str, subject: &str) -> bool {
    cookie_value(headers, cookie)
        .and_then(|token| decode_session_token(&config.app.session_secret, &token, subject))
        .is_some()
}

pub fn has_admin_session(config: &Config, headers: &HeaderMap) -> bool {
    has_valid_session(config, headers, ADMIN_SESSION_COOKIE, "admin")
}

pub fn has_public_session(config: &Config, headers: &HeaderMap) -> bool {
    has_valid_session(config, headers, PUBLIC_SESSION_COOKIE, "public")
}

/// Whether a caller may reach the public surface: admin/public session,
/// app key, configured public key, or open public mode.
pub fn has_public_access(config: &Config, provided: Option<&str>, headers: &HeaderMap) -> bool {
    if has_admin_session(config, headers) || has_public_session(config, headers) {
        return true;
    }
    let provided = provided.unwrap_or("");
    if constant_time_eq(provided, &config.app.app_key) {
        return true;
    }
    if config.app.public_key.is_empty() {
        return config.app.public_enabled;
    }
    constant_time_eq(provided, &config.app.public_key)
}

/// Gate the OpenAI-compatible surface. Returns the identity used for
/// logging (masked later): the key itself, "session", or "public".
pub async fn verify_api_key(
    config: &Config,
    api_keys: &ApiKeyManager,
    headers: &HeaderMap,
) -> Result<String, AppError> {
    if has_admin_session(config, headers) || has_public_session(config, headers) {
        return Ok("session".to_string());
    }

    let provided = bearer_token(headers);
    if has_public_access(config, provided.as_deref(), headers) {
        return Ok(provided.unwrap_or_else(|| "public".to_string()));
    }

    // No primary key and no managed keys: the surface is open
    if config.app.api_key.is_empty() && !api_keys.has_keys().await {
        return Ok(String::new());
    }

    let Some(provided) = provided else {
        return Err(AppError::Auth("Missing authentication token".to_string()));
    };

    if constant_time_eq(&provided, &config.app.api_key) {
        return Ok(provided);
    }
    if api_keys.validate(&provided).await.is_some() {
        api_keys.record_usage(&provided).await;
        return Ok(provided);
    }

    Err(AppError::Auth("Invalid authentication token".to_string()))
}

/// Gate the admin surface: app key as bearer, or an admin session cookie.
pub fn verify_app_key(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    if let Some(provided) = bearer_token(headers) {
        if constant_time_eq(&provided, &config.app.app_key) {
            return Ok(());
        }
    }
    if has_admin_session(config, headers) {
        return Ok(());
    }
    Err(AppError::Auth("Invalid authentication token".to_string()))
}

/// Gate the public imagine/video surface. `query_key` supports SSE clients
/// that cannot set headers.
pub fn verify_public_key(
    config: &Config,
    headers: &HeaderMap,
    query_key: Option<&str>,
) -> Result<(), AppError> {
    let provided = bearer_token(headers);
    if has_public_access(config, provided.as_deref(), headers) {
        return Ok(());
    }
    if let Some(query_key) = query_key {
        if !query_key.is_empty() && has_public_access(config, Some(query_key), headers) {
            return Ok(());
        }
    }
    if config.app.public_key.is_empty() && !config.app.public_enabled {
        return Err(AppError::Auth("Public access is disabled".to_string()));
    }
    Err(AppError::Auth("Invalid authentication token".to_string()))
}
