use anyhow::{Context, Result};
use capture_monitor::config::Config;
use capture_monitor::hub::BroadcastHub;
use capture_monitor::poller::Poller;
use capture_monitor::registry::SubscriberRegistry;
use capture_monitor::scanner::CaptureScanner;
use capture_monitor::server::{start_server, AppState};
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
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        capture_root = %config.capture.root.display(),
        listen_addr = %config.listen_addr(),
        "Starting capture monitor"
    );

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    // Initialize components
    let registry = Arc::new(SubscriberRegistry::new());
    let hub = Arc::new(BroadcastHub::new(registry, &config.hub));
    let poller = Poller::new(CaptureScanner::new(config.capture.clone()), &config.poller);
    let shutdown = CancellationToken::new();

    // Spawn poller task
    let poller_handle = tokio::spawn(poller.run(hub.clone(), shutdown.clone()));

    // Spawn stats logger task
    let stats_handle = config.hub.stats_log_interval().map(|interval| {
        tokio::spawn(hub.clone().run_stats_logger(interval, shutdown.clone()))
    });

    // Spawn listener task
    let api_state = AppState {
        service_name: config.service.name.clone(),
        hub: hub.clone(),
        subscriber_queue_size: config.hub.subscriber_queue_size,
    };
    let server_config = config.server.clone();
    let capture_root = config.capture.root.clone();
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result =
                start_server(api_state, &server_config, capture_root, shutdown.clone()).await;
            if let Err(e) = result {
                error!(error = %e, "Listener error");
                shutdown.cancel();
            }
        }
    });

    info!("Capture monitor started");

    // Wait for shutdown signal or a fatal listener error
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {}
    }

    info!("Shutting down capture monitor");
    shutdown.cancel();

    let _ = poller_handle.await;
    let _ = server_handle.await;
    if let Some(handle) = stats_handle {
        let _ = handle.await;
    }

    hub.log_stats("Final delivery stats");
    info!("Capture monitor stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
