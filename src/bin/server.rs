//! Process entry point: loads configuration, wires the gateway/caches/
//! services, starts the HTTP server, and drains the search-cache cleanup
//! task on shutdown (§9's "teardown drains background tasks").

use chunkcache::cache::entity::EntityCache;
use chunkcache::chunk_service::ChunkService;
use chunkcache::search_service::SearchService;
use chunkcache::{BreakerRegistry, CircuitBreakerConfig, Config, StorageGateway};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).json().init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "fatal: configuration error");
            return ExitCode::from(1);
        }
    };

    let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default_for("storage")));
    let gateway = Arc::new(StorageGateway::new(config.storage_api_url.clone(), config.storage_api_key.clone(), breakers.clone()));
    let entity_cache = Arc::new(EntityCache::new(config.cache_max_size));
    let chunks = Arc::new(ChunkService::new(gateway.clone(), entity_cache.clone()));
    let search = Arc::new(SearchService::new(gateway.clone(), chunks.clone()));

    let shutdown = CancellationToken::new();
    let cleanup_handle = spawn_search_cache_cleanup(gateway.clone(), config.search_cache_cleanup_interval, shutdown.clone());

    let state = chunkcache::http::AppState { chunks, search, entity_cache, gateway, breakers };
    let app = chunkcache::http::build_router(state);

    let listener = match tokio::net::TcpListener::bind("0.0.0.0:8080").await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "fatal: failed to bind HTTP listener");
            return ExitCode::from(1);
        }
    };
    tracing::info!(addr = "0.0.0.0:8080", "listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown.clone()));
    if let Err(e) = server.await {
        tracing::error!(error = %e, "server error");
        shutdown.cancel();
        let _ = cleanup_handle.await;
        return ExitCode::from(2);
    }

    shutdown.cancel();
    let _ = cleanup_handle.await;
    ExitCode::SUCCESS
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining background tasks");
    shutdown.cancel();
}

fn spawn_search_cache_cleanup(gateway: Arc<StorageGateway>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("search cache cleanup task draining");
                    break;
                }
                _ = ticker.tick() => {
                    let cancel = CancellationToken::new();
                    match gateway.cleanup_expired_search_cache(&cancel).await {
                        Ok(deleted) => tracing::info!(deleted, "search cache cleanup completed"),
                        Err(e) => tracing::warn!(error = %e, "search cache cleanup failed"),
                    }
                }
            }
        }
    })
}
