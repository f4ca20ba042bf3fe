use anyhow::{Context, Result};
use photodrop_pipeline::NotificationSource;
use photodrop_workers::topology::INGESTION_SUBSCRIPTION;
use photodrop_workers::{
    start_api_server, AppState, Collaborators, Config, MemoryMetadataStore, MetadataStore,
    PgMetadataStore, S3ObjectStore, SmtpMailer, Topology, TopologySettings,
};
use std::sync::Arc;
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

    info!(
        service = %config.service.name,
        "Starting photodrop image pipeline"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize collaborators
    let metadata_store = build_metadata_store(&config).await?;
    let objects = Arc::new(S3ObjectStore::new(&config.s3).await);
    let mailer = Arc::new(SmtpMailer::new(&config.mail).context("Failed to initialize mailer")?);

    let topology = Topology::build(
        TopologySettings::from_config(&config),
        Collaborators {
            objects,
            metadata: metadata_store.clone(),
            mailer,
        },
    )
    .context("Failed to build pipeline topology")?;
    let worker_handles = topology.spawn();

    // Kafka ingress into the broker; offsets wait for the ingestion queue
    let source = Arc::new(
        NotificationSource::new(&config.kafka, topology.broker())
            .context("Failed to initialize Kafka notification source")?
            .commit_after(INGESTION_SUBSCRIPTION, &topology.ingestion_queue()),
    );
    let source_handle = {
        let source = source.clone();
        tokio::spawn(async move {
            if let Err(e) = source.run().await {
                error!(error = %e, "Notification source error");
            }
        })
    };

    // Spawn API server task
    let api_shutdown = CancellationToken::new();
    let api_state = AppState {
        metadata_store,
        ingestion_queue: topology.ingestion_queue(),
        dead_letter_queue: topology.dead_letter_queue(),
    };
    let api_handle = {
        let api_config = config.api.clone();
        let shutdown = api_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
                error!(error = %e, "API server error");
            }
        })
    };

    info!("Photodrop started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down photodrop");

    source.shutdown();
    if let Err(e) = source_handle.await {
        warn!(error = %e, "Notification source task ended abnormally");
    }

    topology.shutdown(worker_handles).await;

    api_shutdown.cancel();
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task ended abnormally");
    }

    info!("Photodrop stopped");

    Ok(())
}

/// PostgreSQL when a URL is configured, otherwise an in-process store
async fn build_metadata_store(config: &Config) -> Result<Arc<dyn MetadataStore>> {
    let Some(url) = config.database.url.as_deref() else {
        warn!("database.url not set; image records are kept in memory only");
        return Ok(Arc::new(MemoryMetadataStore::new()));
    };

    let store = PgMetadataStore::connect(url, &config.database)
        .await
        .context("Failed to initialize metadata store")?;

    if config.database.create_table {
        store
            .ensure_schema()
            .await
            .context("Failed to create image record table")?;
    }

    Ok(Arc::new(store))
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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
