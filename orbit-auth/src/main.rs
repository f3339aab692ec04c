use orbit_auth::{
    build_router,
    config::{CacheBackendKind, OrbitConfig, StoreBackend},
    db,
    services::{metrics, Cache, CacheBackend, InMemoryCache, MemoryStore, PgStore, RedisCache, Store, TokenSigner},
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = OrbitConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    metrics::init_metrics().map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting orbit authorization server"
    );

    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.database)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let cache_backend: Arc<dyn CacheBackend> = match config.cache.backend {
        CacheBackendKind::Redis => Arc::new(
            RedisCache::new(&config.cache.redis_url)
                .await
                .map_err(AppError::CacheError)?,
        ),
        CacheBackendKind::Memory => Arc::new(InMemoryCache::new()),
    };
    let cache = Cache::new(cache_backend);
    tracing::info!(backend = ?config.cache.backend, "Cache initialized");

    let signer = TokenSigner::from_config(&config.jwt).map_err(AppError::ConfigError)?;
    let signing_key = signer
        .signing_key_record()
        .map_err(AppError::ConfigError)?;
    store
        .upsert_signing_key(&signing_key)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    tracing::info!(kid = %signing_key.kid, "Active signing key published");

    let addr: SocketAddr = config
        .common
        .bind_addr()
        .parse()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("invalid bind address: {}", e)))?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );

    let state = AppState::new(config, store, cache, Arc::new(signer))?;
    let app = build_router(state);

    let _guard = service_span.enter();
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
