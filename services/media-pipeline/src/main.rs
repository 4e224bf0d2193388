use anyhow::{Context, Result};
use media_pipeline::api::{start_api_server, AppState};
use media_pipeline::asset::AssetRepository;
use media_pipeline::asset_store::PgAssetStore;
use media_pipeline::cache::{DistributedTier, InvalidationListener, RedisTier, TieredCache};
use media_pipeline::config::{Config, ConfigWatcher};
use media_pipeline::dispatcher::{
    HttpTarget, LocalTarget, PgEventSource, Reconciler, TriggerDispatcher, TriggerTarget,
};
use media_pipeline::migration::MediaMigrator;
use media_pipeline::object_store::S3ObjectStore;
use media_pipeline::origin::HttpOriginFetcher;
use media_pipeline::rate_limiter::RateLimiter;
use media_pipeline::thumbnail::{FfmpegExtractor, ThumbnailGenerator};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting media pipeline");

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = PgAssetStore::new(&config.database)
        .await
        .context("Failed to initialize asset store")?;

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let pool = store.pool().clone();
    let repo: Arc<dyn AssetRepository> = Arc::new(store);

    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );

    let origin = Arc::new(
        HttpOriginFetcher::new(
            config.migration.download_timeout(),
            config.migration.max_download_bytes,
        )
        .context("Failed to build origin HTTP client")?,
    );

    let l3: Option<Arc<dyn DistributedTier>> = match &config.cache.redis_url {
        Some(url) => match RedisTier::new(url, config.cache.redis_pool_size, config.cache.redis_timeout()) {
            Ok(tier) => Some(Arc::new(tier)),
            Err(e) => {
                warn!(error = %e, "Distributed cache disabled");
                None
            }
        },
        None => None,
    };
    let cache = Arc::new(TieredCache::from_config(&config.cache, l3).await);

    let shutdown = CancellationToken::new();
    let watcher = ConfigWatcher::new(&config);
    let (dispatch_handle, dispatch_rx) = TriggerDispatcher::channel(config.dispatcher.queue_capacity);

    let migrator = Arc::new(
        MediaMigrator::new(
            repo.clone(),
            origin,
            object_store.clone(),
            cache.clone(),
            config.migration.clone(),
            watcher.subscribe(),
        )
        .with_dispatcher(dispatch_handle.clone()),
    );

    let thumbnails = Arc::new(ThumbnailGenerator::new(
        repo.clone(),
        object_store,
        Arc::new(FfmpegExtractor::new(config.thumbnail.clone())),
        cache.clone(),
        config.thumbnail.clone(),
        watcher.subscribe(),
    ));

    let target: Arc<dyn TriggerTarget> = match &config.dispatcher.remote_base_url {
        Some(base_url) => {
            info!(base_url = %base_url, "Dispatching triggers to remote endpoints");
            Arc::new(
                HttpTarget::new(base_url, config.dispatcher.call_timeout())
                    .context("Failed to build trigger HTTP client")?,
            )
        }
        None => Arc::new(LocalTarget::new(migrator.clone(), thumbnails.clone())),
    };

    let limiter = Arc::new(RateLimiter::new(watcher.subscribe()));

    let mut tasks = Vec::new();

    let dispatcher = TriggerDispatcher::new(dispatch_rx, target, &config.dispatcher);
    tasks.push(tokio::spawn(dispatcher.run(shutdown.clone())));

    let reconciler = Reconciler::new(
        repo.clone(),
        cache.clone(),
        dispatch_handle.clone(),
        config.dispatcher.clone(),
        watcher.subscribe(),
    );
    tasks.push(tokio::spawn(reconciler.run(shutdown.clone())));

    let events = PgEventSource::new(pool, config.dispatcher.listen_channel.clone());
    tasks.push(tokio::spawn(events.run(dispatch_handle.clone(), shutdown.clone())));

    if let Some(interval) = config.cache.sweep_interval() {
        tasks.push(tokio::spawn(cache.clone().run_sweeper(interval, shutdown.clone())));
    }

    if let Some(redis_url) = config.cache.redis_url.clone() {
        let listener = InvalidationListener { redis_url };
        let cache = cache.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            listener
                .run(
                    move |key| {
                        let cache = cache.clone();
                        async move { cache.evict_local(&key).await }
                    },
                    token,
                )
                .await
        }));
    }

    {
        let limiter = limiter.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move { limiter.run_sweeper(token).await }));
    }

    tasks.push(tokio::spawn(watcher.run(shutdown.clone())));

    let api_state = AppState {
        repo,
        migrator,
        thumbnails,
        cache,
        limiter,
        dispatcher: dispatch_handle,
    };
    let api_config = config.api.clone();
    let api_token = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_token).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Media pipeline started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down media pipeline");
    shutdown.cancel();

    if tokio::time::timeout(Duration::from_secs(30), async {
        let _ = api_handle.await;
        for task in tasks {
            let _ = task.await;
        }
    })
    .await
    .is_err()
    {
        warn!("Background tasks did not stop within 30s");
    }

    info!("Media pipeline stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
