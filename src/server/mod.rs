pub mod handlers;
pub(crate) mod request_logging;
pub(crate) mod storage_traits;
pub(crate) mod tee;
pub(crate) mod upstream;
pub(crate) mod util;

use crate::actor::{ActorSource, StaticActorSource};
use crate::config::Settings;
use crate::error::Result as AppResult;
use crate::http_client;
use crate::logging::{BufferedEventLogger, DatabaseLogger, EventLogger, SqlitePromptRecorder};
use crate::providers::{
    self, AnthropicAdapter, FireworksAdapter, GoogleAdapter, ProviderAdapter, UpstreamHandlerConfig,
};
use crate::ratelimit::{MemoryRateLimitStore, NoopNotifier, RateLimitNotifier, RateLimiter, WebhookNotifier};
use crate::server::storage_traits::PromptRecorder;
use crate::server::upstream::{CompletionsHandler, UpstreamHandler};
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub type HandlerTable = HashMap<&'static str, Arc<dyn CompletionsHandler>>;

#[derive(Clone)]
pub struct AppState {
    pub config: Settings,
    pub actors: Arc<dyn ActorSource>,
    pub rate_limiter: Arc<RateLimiter>,
    pub notifier: Arc<dyn RateLimitNotifier>,
    pub event_logger: Arc<dyn EventLogger>,
    pub prompt_recorder: Arc<dyn PromptRecorder>,
    pub handlers: Arc<HandlerTable>,
}

pub async fn create_app(config: Settings) -> AppResult<Router> {
    let db_logger = DatabaseLogger::new(&config.logging.database_path).await?;
    let event_logger = BufferedEventLogger::spawn(
        Arc::new(db_logger.clone()),
        config.logging.event_queue_size,
    );
    let prompt_recorder =
        SqlitePromptRecorder::new(db_logger, config.logging.flagged_prompt_retention_minutes);

    let notifier: Arc<dyn RateLimitNotifier> = match &config.notifications.rate_limit_webhook_url {
        Some(url) if !url.trim().is_empty() => {
            let client = http_client::client_for_url_with_timeout(
                url,
                Duration::from_secs(10),
                &config.upstream.no_proxy_hosts,
            )?;
            Arc::new(WebhookNotifier::new(client, url.clone()))
        }
        _ => Arc::new(NoopNotifier),
    };

    let handlers = build_handlers(&config)?;
    if handlers.is_empty() {
        tracing::warn!("No completions provider configured; every completions request will return 404");
    }

    let app_state = AppState {
        actors: Arc::new(StaticActorSource::from_config(&config.actors)?),
        rate_limiter: Arc::new(RateLimiter::new(Arc::new(MemoryRateLimitStore::new()))),
        notifier,
        event_logger: Arc::new(event_logger),
        prompt_recorder: Arc::new(prompt_recorder),
        handlers: Arc::new(handlers),
        config,
    };

    Ok(router(app_state))
}

pub fn router(app_state: AppState) -> Router {
    handlers::routes()
        .with_state(Arc::new(app_state))
        .layer(TraceLayer::new_for_http())
}

fn build_handlers(config: &Settings) -> AppResult<HandlerTable> {
    let mut table = HandlerTable::new();

    if let Some(cfg) = &config.completions.anthropic {
        let adapter = AnthropicAdapter::new(
            UpstreamHandlerConfig::from_provider(cfg, providers::anthropic::DEFAULT_BASE_URL),
            providers::load_tokenizer(cfg)?,
        );
        register(&mut table, adapter, config)?;
    }
    if let Some(cfg) = &config.completions.fireworks {
        let adapter = FireworksAdapter::new(
            UpstreamHandlerConfig::from_provider(cfg, providers::fireworks::DEFAULT_BASE_URL),
            providers::load_tokenizer(cfg)?,
        );
        register(&mut table, adapter, config)?;
    }
    if let Some(cfg) = &config.completions.google {
        let adapter = GoogleAdapter::new(
            UpstreamHandlerConfig::from_provider(cfg, providers::google::DEFAULT_BASE_URL),
            providers::load_tokenizer(cfg)?,
        );
        register(&mut table, adapter, config)?;
    }

    Ok(table)
}

fn register<P: ProviderAdapter>(table: &mut HandlerTable, adapter: P, config: &Settings) -> AppResult<()> {
    let upstream = adapter.config();
    if upstream.access_token.trim().is_empty() {
        tracing::warn!("{} access token not configured, provider disabled", P::NAME);
        return Ok(());
    }
    if upstream.allowed_models.is_empty() {
        tracing::warn!("{} has no allowed models; every request will be rejected", P::NAME);
    }
    let client = http_client::client_for_url_with_timeout(
        &upstream.base_url,
        Duration::from_secs(config.upstream.timeout_seconds),
        &config.upstream.no_proxy_hosts,
    )?;
    tracing::info!(
        "Registered {} provider ({} models, tokenizer: {})",
        P::NAME,
        upstream.allowed_models.len(),
        adapter.tokenizer().is_some()
    );
    table.insert(P::NAME, Arc::new(UpstreamHandler::new(adapter, Arc::new(client))));
    Ok(())
}
