// Application state - singleton managers with an explicit lifecycle
//
// Everything stateful is built here once (init), injected by Arc into the
// HTTP layer, and drained on shutdown: background loops get a watch-channel
// signal, debounced persisters flush whatever is still dirty, and the
// storage handle closes last.

use crate::api_keys::ApiKeyManager;
use crate::breaker::CircuitBreaker;
use crate::chat::ChatService;
use crate::config::{self, Config, SharedConfig};
use crate::conversation::ConversationStore;
use crate::persist;
use crate::proxy_pool::ProxyPool;
use crate::request_log::RequestLogger;
use crate::stats::RequestStats;
use crate::storage::{self, Storage};
use crate::tickets::TicketStore;
use crate::token::TokenManager;
use crate::upstream::AppChatClient;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub struct AppState {
    pub config: SharedConfig,
    pub storage: Arc<dyn Storage>,
    pub tokens: Arc<TokenManager>,
    pub conversations: Arc<ConversationStore>,
    pub proxy_pool: Arc<ProxyPool>,
    pub stats: Arc<RequestStats>,
    pub request_log: Arc<RequestLogger>,
    pub api_keys: Arc<ApiKeyManager>,
    pub tickets: Arc<TicketStore>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub chat: ChatService,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Build every manager, load persisted state, and start the background
    /// loops (cooldown probe, TTL sweep, proxy refresh, one persister per
    /// entity).
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        let storage = storage::open(
            &config.server.storage_type,
            &config.server.storage_url,
            Path::new("./data"),
        )?;

        let tokens = TokenManager::new(storage.clone(), config.token.clone());
        let conversations = ConversationStore::new(storage.clone(), config.conversation.clone());
        let stats = RequestStats::new(storage.clone(), config.stats.clone());
        let request_log = RequestLogger::new(storage.clone(), config.logs.clone());
        let api_keys = ApiKeyManager::new(storage.clone(), config.api_keys.clone());
        let tickets = Arc::new(TicketStore::new(config.session.ticket_ttl_sec));

        tokens.load().await?;
        conversations.load().await?;
        stats.load().await?;
        request_log.load().await?;
        api_keys.load().await?;

        let proxy_pool = ProxyPool::new(config.proxy.clone());
        let upstream = AppChatClient::new(proxy_pool.clone(), &config.proxy, &config.chat);
        let breaker = config
            .breaker
            .enabled
            .then(|| Arc::new(CircuitBreaker::new("app-chat", config.breaker.clone())));

        let shared_config = config::shared(config);
        let chat = ChatService::new(
            shared_config.clone(),
            tokens.clone(),
            conversations.clone(),
            upstream,
            breaker.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        tasks.push(tokens.spawn_cooldown_probe(shutdown_rx.clone()));
        tasks.push(conversations.spawn_cleanup_loop(shutdown_rx.clone()));
        if let Some(handle) = proxy_pool.spawn_refresh_loop(shutdown_rx.clone()) {
            tasks.push(handle);
        }

        // One debounced persister per entity
        {
            let tokens = tokens.clone();
            tasks.push(persist::spawn_flusher(
                "tokens",
                tokens.debounce(),
                shutdown_rx.clone(),
                move || {
                    let tokens = tokens.clone();
                    async move { tokens.save().await }
                },
            ));
        }
        {
            let conversations = conversations.clone();
            tasks.push(persist::spawn_flusher(
                "conversations",
                conversations.debounce(),
                shutdown_rx.clone(),
                move || {
                    let conversations = conversations.clone();
                    async move { conversations.save().await }
                },
            ));
        }
        {
            let stats = stats.clone();
            tasks.push(persist::spawn_flusher(
                "stats",
                stats.debounce(),
                shutdown_rx.clone(),
                move || {
                    let stats = stats.clone();
                    async move { stats.save().await }
                },
            ));
        }
        {
            let request_log = request_log.clone();
            tasks.push(persist::spawn_flusher(
                "logs",
                request_log.debounce(),
                shutdown_rx.clone(),
                move || {
                    let request_log = request_log.clone();
                    async move { request_log.save().await }
                },
            ));
        }
        {
            let api_keys = api_keys.clone();
            tasks.push(persist::spawn_flusher(
                "api_keys",
                api_keys.debounce(),
                shutdown_rx,
                move || {
                    let api_keys = api_keys.clone();
                    async move { api_keys.save().await }
                },
            ));
        }

        Ok(Arc::new(Self {
            config: shared_config,
            storage,
            tokens,
            conversations,
            proxy_pool,
            stats,
            request_log,
            api_keys,
            tickets,
            breaker,
            chat,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Current config snapshot.
    pub fn config_snapshot(&self) -> Config {
        config::snapshot(&self.config)
    }

    /// Stop background loops, drain dirty state, release storage.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down: draining background tasks");
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        // The persisters already drained on signal; a second flush here
        // catches mutations that raced the shutdown.
        if let Err(e) = self.tokens.flush().await {
            tracing::error!("token flush on shutdown failed: {e:#}");
        }
        if let Err(e) = self.conversations.flush().await {
            tracing::error!("conversation flush on shutdown failed: {e:#}");
        }
        if let Err(e) = self.stats.flush().await {
            tracing::error!("stats flush on shutdown failed: {e:#}");
        }
        if let Err(e) = self.request_log.flush().await {
            tracing::error!("request log flush on shutdown failed: {e:#}");
        }
        if let Err(e) = self.api_keys.flush().await {
            tracing::error!("api key flush on shutdown failed: {e:#}");
        }
        if let Err(e) = self.storage.close().await {
            tracing::error!("storage close failed: {e:#}");
        }
        tracing::info!("shutdown complete");
    }
}
