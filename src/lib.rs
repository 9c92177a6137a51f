//! dualtrans: dual machine + LLM translation API.
//! Library root: module tree, shared application state, server startup.

pub mod api;
pub mod cancellation;
pub mod config;
pub mod memory;
pub mod metrics;
pub mod state_machine;
pub mod translate;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use cancellation::SessionRegistry;
use config::ServerConfig;
use memory::MemoryStore;
use metrics::MetricsRegistry;
use translate::cache::{MemoryResultCache, ResultCache, TieredCache};
use translate::free::{http_client, FreeBackend, GoogleGtx, Lingva, MyMemory};
use translate::glossary::Glossary;
use translate::providers::HttpProviderFactory;
use translate::racer::Racer;
use translate::sqlite_cache::SqliteResultCache;
use translate::TranslationService;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TranslationService>,
    pub memory: Arc<MemoryStore>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dualtrans=debug,tower_http=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }
}

/// Wire the service graph from configuration. Needs a Tokio runtime.
pub fn build_state(config: &ServerConfig) -> Result<AppState> {
    let metrics = Arc::new(MetricsRegistry::new());

    let glossary = match &config.glossary {
        Some(path) => Glossary::load_from_file(path).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "glossary load failed, using empty");
            Glossary::empty()
        }),
        None => Glossary::empty(),
    };
    info!(entries = glossary.len(), version = glossary.version(), "glossary ready");

    let l1 = MemoryResultCache::new(config.cache_capacity.max(1));
    let cache: Arc<dyn ResultCache> = match &config.cache_db {
        Some(path) => {
            let l2 = Arc::new(
                SqliteResultCache::open(path)
                    .with_context(|| format!("failed to open cache db {}", path.display()))?,
            );
            SqliteResultCache::start_cleanup_loop(Arc::clone(&l2));
            Arc::new(TieredCache::new(l1, l2, config.service_settings().cache_ttl))
        }
        None => Arc::new(l1),
    };

    let memory = match &config.memory_db {
        Some(path) => MemoryStore::open(path)
            .with_context(|| format!("failed to open memory db {}", path.display()))?,
        None => MemoryStore::open_in_memory().context("failed to open in-memory memory db")?,
    };

    let http = http_client(config.http_timeout()).context("failed to build HTTP client")?;
    let backends: Vec<Arc<dyn FreeBackend>> = vec![
        Arc::new(GoogleGtx::new(http.clone(), config.google_url.clone())),
        Arc::new(MyMemory::new(http.clone(), config.mymemory_url.clone())),
        Arc::new(Lingva::new(http.clone(), config.lingva_url.clone())),
    ];
    let racer = Racer::new(backends).with_detect_timeout(config.detect_timeout());
    let providers = Arc::new(HttpProviderFactory::new(http, config.retry_policy()));

    let service = TranslationService::new(racer, providers, cache, Arc::clone(&metrics))
        .with_memory(Arc::clone(&memory))
        .with_glossary(Arc::new(glossary))
        .with_settings(config.service_settings());

    Ok(AppState {
        service: Arc::new(service),
        memory,
        sessions: Arc::new(SessionRegistry::new()),
        metrics,
    })
}

pub async fn run(config: ServerConfig) -> Result<()> {
    init_tracing(config.log_json);
    info!("dualtrans starting");

    let state = build_state(&config)?;
    let app = api::router(state);

    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    info!("dualtrans stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
