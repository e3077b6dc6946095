// grokgate - OpenAI-compatible gateway over a browser-session chat upstream
//
// Clients speak standard chat-completions / image-generation APIs; the
// gateway rewrites requests onto the upstream's private endpoints,
// multiplexes them across a pool of session tokens, keeps multi-turn
// conversations alive across tokens via share-link cloning, and streams
// responses back as OpenAI delta frames.
//
// Architecture:
// - Token pool: quota-bucketed selection, cooldowns, count-based thaw
// - Retry orchestrator: cross-token rotation with failure classification
// - Conversation manager: hash-based auto-resume + share-link migration
// - Stream processor: think markers, tag filters, three-tier timeouts
// - Proxy pool: dynamic egress rotation to survive upstream IP blocks
// - Debounced persisters: one writer task per persisted entity

mod api_keys;
mod auth;
mod breaker;
mod chat;
mod cli;
mod config;
mod conversation;
mod error;
mod models;
mod persist;
mod proxy_pool;
mod request_log;
mod server;
mod state;
mod stats;
mod storage;
mod tickets;
mod token;
mod upstream;

use config::Config;
use state::AppState;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    // Handle CLI subcommands first (config --path, config show)
    if cli::handle_cli() {
        return;
    }

    // Configuration failures are exit code 1 per the ops contract
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e:#}");
        std::process::exit(1);
    }

    init_tracing(&config);

    // Build the runtime by hand so SERVER_WORKERS maps to worker threads
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.server.workers > 0 {
        builder.worker_threads(config.server.workers);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

fn init_tracing(config: &Config) {
    // Precedence: RUST_LOG env var > LOG_LEVEL / config file > "info"
    let default_filter = format!("grokgate={},axum=info", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run(config: Config) -> i32 {
    tracing::info!(
        "grokgate {} starting: bind={} storage={}",
        config::VERSION,
        config.bind_addr(),
        config.server.storage_type,
    );

    let state = match AppState::init(config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("startup failed: {e:#}");
            return 1;
        }
    };

    let server_state = Arc::clone(&state);
    if let Err(e) = server::serve(server_state, shutdown_signal()).await {
        tracing::error!("server error: {e:#}");
        state.shutdown().await;
        return 1;
    }

    state.shutdown().await;
    0
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
        term.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
