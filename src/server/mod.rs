// HTTP server - route assembly and lifecycle
//
// The OpenAI-compatible surface, the public imagine/video surface, and the
// admin surface all share one axum router over the injected AppState.

mod admin;
mod openai;
mod public;

use crate::state::AppState;
use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // OpenAI-compatible surface
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::models))
        .route("/v1/images/generations", post(openai::images_generations))
        // Public imagine/video surface (session-ticket pattern)
        .route("/v1/public/imagine/start", post(public::imagine_start))
        .route("/v1/public/imagine/sse", get(public::imagine_sse))
        .route("/v1/public/imagine/stop", post(public::imagine_stop))
        .route("/v1/public/imagine/config", get(public::imagine_config))
        .route("/v1/public/video/start", post(public::video_start))
        .route("/v1/public/video/sse", get(public::video_sse))
        .route("/v1/public/video/stop", post(public::video_stop))
        // Admin surface
        .route("/v1/admin/login", post(admin::login))
        .route("/v1/admin/logout", post(admin::logout))
        .route("/v1/admin/config", get(admin::get_config))
        .route(
            "/v1/admin/keys",
            get(admin::list_keys)
                .post(admin::add_key)
                .delete(admin::delete_keys),
        )
        .route("/v1/admin/keys/update", post(admin::update_key))
        .route(
            "/v1/admin/tokens",
            get(admin::list_tokens)
                .post(admin::add_token)
                .delete(admin::delete_token),
        )
        .route("/v1/admin/stats", get(admin::get_stats).delete(admin::reset_stats))
        .route("/v1/admin/logs", get(admin::get_logs).delete(admin::clear_logs))
        .route(
            "/v1/admin/conversations",
            get(admin::list_conversations).delete(admin::delete_conversation),
        )
        .route("/v1/admin/breaker", get(admin::get_breaker))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind_addr = state.config_snapshot().bind_addr();
    let app = build_router(state);

    tracing::info!("starting server on {bind_addr}");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}
