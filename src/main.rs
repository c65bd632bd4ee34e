use idempotency_coordinator::api::{create_router, with_http_layers, with_idempotency, AppState};
use idempotency_coordinator::config::Settings;
use idempotency_coordinator::idempotency::{
    IdempotencyCleanupJob, IdempotencyConfig, IdempotencyCoordinator, RedisSharedCache,
    SharedCacheClient,
};
use idempotency_coordinator::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::new(
        settings.application.log_level.clone(),
        &settings.application.log_format,
    ))?;
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    // Shared cache is optional; without it every instance uses its own file store
    let shared_cache: Option<Arc<dyn SharedCacheClient>> = match &settings.redis.url {
        Some(url) => {
            info!("Using Redis shared cache at {}", url);
            Some(Arc::new(RedisSharedCache::open(url)?))
        }
        None => {
            info!("No shared cache configured, using file store only");
            None
        }
    };

    let config = IdempotencyConfig::from_settings(&settings)?;
    info!(
        "Idempotency: ttl {:?}, lock ttl {:?}, data dir {}",
        config.entry_ttl,
        config.lock_ttl(),
        config.data_dir.display()
    );

    let health_checker = Arc::new(HealthChecker::new(
        config.data_dir.clone(),
        shared_cache.clone(),
    ));
    let coordinator = IdempotencyCoordinator::new(config, shared_cache)?;

    let _cleanup = IdempotencyCleanupJob::new(
        coordinator.clone(),
        Duration::from_secs(settings.idempotency.cleanup_interval_seconds),
    )
    .start();

    let state = AppState::new(coordinator)
        .with_metrics(metrics_handle)
        .with_health_checker(health_checker);
    let app = with_http_layers(with_idempotency(create_router(state.clone()), state));

    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
