// src/main.rs
use anyhow::Result;
use clap::Parser;
use network_monitor::{
    config::{self, Config},
    metrics::{start_metrics_server, MetricsRegistry},
    registry::Target,
    Monitor, MonitorHandle,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "network-monitor", version, about = "Probe network targets and track their health")]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(short, long, value_name = "SECONDS")]
    runtime: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("network_monitor=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let runtime = cli.runtime.map(Duration::from_secs);

    info!("Loading configuration from: {}", cli.config);
    let config = config::load_config(&cli.config).await?;
    let targets = build_targets(&config)?;

    // Initialize metrics
    let metrics_registry = Arc::new(MetricsRegistry::new()?);
    let (metrics_shutdown_tx, metrics_shutdown_rx) = watch::channel(false);
    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(
            metrics_addr,
            metrics_registry.clone(),
            config.metrics.path.clone(),
            metrics_shutdown_rx,
        )
        .await?;
    }

    let handle = Monitor::builder(config.settings.clone())
        .metrics(metrics_registry.collector())
        .start(targets)?;

    run_until_stopped(&handle, config.report.interval(), runtime).await;

    let report = handle.stop().await?;
    let _ = metrics_shutdown_tx.send(true);

    if report.abandoned > 0 {
        warn!(
            abandoned = report.abandoned,
            "Some probes did not finish before the drain timeout"
        );
    }
    info!(
        cancelled = report.cancelled,
        completed = report.completed,
        "Shutdown complete"
    );

    Ok(())
}

fn build_targets(config: &Config) -> Result<Vec<Target>> {
    config
        .targets
        .iter()
        .map(|target| Target::from_config(target).map_err(anyhow::Error::from))
        .collect()
}

/// Periodically log a status report until a signal arrives or the optional
/// runtime elapses.
async fn run_until_stopped(handle: &MonitorHandle, report_every: Duration, runtime: Option<Duration>) {
    let mut report = tokio::time::interval(report_every);
    report.tick().await;

    let deadline = async {
        match runtime {
            Some(runtime) => tokio::time::sleep(runtime).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = report.tick() => log_report(handle),
            _ = &mut deadline => {
                info!("Configured runtime elapsed");
                break;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    log_report(handle);
}

fn log_report(handle: &MonitorHandle) {
    let counts = handle.status_counts();
    info!(?counts, "Target status");

    match serde_json::to_string(&handle.snapshot_all()) {
        Ok(json) => tracing::debug!(report = %json, "Target states"),
        Err(e) => error!("Failed to serialize target states: {}", e),
    }
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
