use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use gallery_service::api::{start_api_server, AppState};
use gallery_service::config::{Config, ServiceConfig};
use gallery_service::{
    AwsSecretProvider, CaptionStore, GalleryService, MySqlCaptionStore, ObjectStore,
    S3ObjectStore, UploadService,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        debug = config.service.debug,
        "Starting gallery service"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.s3.region.clone()))
        .load()
        .await;

    let object_store: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::new(&sdk_config, &config.s3));

    let mysql_store = match config.database.url {
        Some(ref url) => MySqlCaptionStore::with_url(url, &config.database)
            .context("Invalid database URL")?,
        None => {
            let secret_id = config
                .database
                .secret_id
                .as_deref()
                .context("database.secret_id is required when database.url is unset")?;
            let secrets = AwsSecretProvider::new(&sdk_config, secret_id, config.secret_region());
            MySqlCaptionStore::with_secrets(Arc::new(secrets), &config.database)
        }
    };

    // Run migrations if enabled
    if config.database.run_migrations {
        mysql_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let caption_store: Arc<dyn CaptionStore> = Arc::new(mysql_store);
    let shutdown = CancellationToken::new();

    let api_state = AppState {
        uploads: Arc::new(UploadService::new(
            object_store.clone(),
            caption_store.clone(),
            config.upload.clone(),
            shutdown.child_token(),
        )),
        gallery: Arc::new(GalleryService::new(
            object_store,
            caption_store.clone(),
            config.presigned_url_expiry(),
        )),
        caption_store,
        expose_error_details: config.api.expose_error_details,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let max_upload_bytes = config.upload.max_upload_bytes;
    let server_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) =
            start_api_server(api_state, &api_config, max_upload_bytes, server_shutdown).await
        {
            error!(error = %e, "API server error");
        }
    });

    info!("Gallery service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down gallery service");

    // Cancels pending caption waits and drains open connections
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Gallery service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let default_level = if service.debug {
        "debug"
    } else {
        service.log_level.as_str()
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if service.debug {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
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
