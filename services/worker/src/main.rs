use anyhow::{Context, Result};
use measure_queue::{Broker, BrokerBackend, HandlerRegistry, MemoryBroker, PgBroker, WorkerPool};
use measure_storage::{
    ArtifactStore, MemoryArtifactStore, MemoryMetadataStore, MetadataStore, PgMetadataStore,
    S3ArtifactStore,
};
use measure_worker::{
    start_api_server, AppState, Calibrator, MeasureHandler, MeasurementEngine, MeasurementService,
    ServiceSettings, ThresholdSegmenter, WorkerConfig,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct Backends {
    broker: Arc<dyn Broker>,
    artifacts: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = WorkerConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        role = ?config.service.role,
        backend = ?config.queue.backend,
        "Starting Measure Worker"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let backends = init_backends(&config).await?;

    let engine = MeasurementEngine::new(
        Arc::new(ThresholdSegmenter::new(config.engine.segmenter.clone())),
        Arc::new(Calibrator::new(config.engine.calibration.clone())),
        backends.artifacts.clone(),
        backends.metadata.clone(),
        config.engine.pixel_unit.clone(),
    );

    let mut pool_handles = Vec::new();
    let pool = if config.service.role.runs_workers() {
        let registry = HandlerRegistry::new().with(Arc::new(MeasureHandler::new(engine.clone())));
        info!(kinds = ?registry.kinds(), "Registered job handlers");

        let pool = Arc::new(WorkerPool::new(
            backends.broker.clone(),
            Arc::new(registry),
            config.queue.clone(),
        ));
        pool_handles = pool.spawn();
        Some(pool)
    } else {
        None
    };

    let api_handle = if config.service.role.runs_api() {
        let service = MeasurementService::new(
            backends.broker.clone(),
            engine,
            backends.artifacts.clone(),
            backends.metadata.clone(),
            ServiceSettings {
                default_conf: config.engine.default_conf,
                default_iou: config.engine.default_iou,
                eager_timeout: config.queue.eager_timeout(),
                poll_interval: config.queue.poll_interval(),
            },
        );
        let api_state = AppState {
            service: Arc::new(service),
        };

        // Spawn API server task
        let api_config = config.api.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config).await {
                error!(error = %e, "API server error");
            }
        }))
    } else {
        None
    };

    info!("Measure worker started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down measure worker");

    if let Some(handle) = api_handle {
        handle.abort();
    }

    // Workers finish the job in hand before exiting
    if let Some(pool) = pool {
        pool.shutdown();
        for handle in pool_handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }

    info!("Measure worker stopped");

    Ok(())
}

/// Build the broker and stores for the configured backend
async fn init_backends(config: &WorkerConfig) -> Result<Backends> {
    match config.queue.backend {
        BrokerBackend::Memory => {
            warn!("Using in-memory backends; state is lost on restart");
            Ok(Backends {
                broker: Arc::new(MemoryBroker::new(&config.queue)),
                artifacts: Arc::new(MemoryArtifactStore::new()),
                metadata: Arc::new(MemoryMetadataStore::new()),
            })
        }
        BrokerBackend::Postgres => {
            let database = config
                .database
                .as_ref()
                .context("database configuration is required")?;
            let s3 = config.s3.as_ref().context("s3 configuration is required")?;

            let metadata = PgMetadataStore::new(database)
                .await
                .context("Failed to initialize metadata store")?;
            let broker = PgBroker::new(metadata.pool().clone(), &config.queue);

            // Run migrations if enabled
            if database.run_migrations {
                metadata
                    .run_migrations()
                    .await
                    .context("Failed to run metadata migrations")?;
                broker
                    .run_migrations()
                    .await
                    .context("Failed to run queue migrations")?;
            }

            let artifacts = S3ArtifactStore::new(s3)
                .await
                .context("Failed to initialize S3 artifact store")?;
            artifacts
                .ensure_bucket()
                .await
                .context("Failed to verify S3 bucket")?;

            Ok(Backends {
                broker: Arc::new(broker),
                artifacts: Arc::new(artifacts),
                metadata: Arc::new(metadata),
            })
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
