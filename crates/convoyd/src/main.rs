//! convoy replica daemon
//!
//! Usage:
//!   # Development replica with in-memory tables
//!   convoyd
//!
//!   # Production replica
//!   convoyd --storage postgres \
//!     --database-url "host=db user=convoy password=secret dbname=convoy" \
//!     --instance-id convoy-0 \
//!     --subscription-mode broadcast \
//!     --http-bind 0.0.0.0:8080

use clap::Parser;
use convoy_cluster::{CoordinatorContext, MemoryBroker};
use convoyd::{Cli, HttpState, LogFormat, StorageBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli);

    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }
    let config = cli.to_config();
    print_banner(&cli, &config.instance_id);

    let state_metrics = init_metrics(&cli)?;

    // The daemon ships the in-process loopback broker; other transports
    // plug in through `SourceClient`.
    let broker = MemoryBroker::new(config.subscription_mode);
    let ctx = match cli.storage {
        StorageBackend::Memory => CoordinatorContext::in_memory(config, &broker)?,
        StorageBackend::Postgres => {
            let client = broker.client(config.instance_id.clone());
            CoordinatorContext::postgres(config, Arc::new(client)).await?
        }
    };

    let cancel = CancellationToken::new();
    let mut tasks = ctx.start(cancel.clone()).await?;

    let state = state_metrics(HttpState::new(ctx.health.clone()));
    let http_cancel = cancel.clone();
    let http_bind = cli.http_bind;
    tasks.push(tokio::spawn(async move {
        if let Err(e) = convoyd::serve(http_bind, state, http_cancel.clone()).await {
            tracing::error!("HTTP server failed: {}", e);
            http_cancel.cancel();
        }
    }));

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
        }
        _ = cancel.cancelled() => {
            tracing::warn!("A required task stopped, shutting down");
        }
    }
    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(cli.shutdown_timeout_secs);
    let drained = tokio::time::timeout(shutdown_timeout, async {
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Task panicked: {}", e);
            }
        }
    })
    .await;
    match drained {
        Ok(()) => tracing::info!("Replica shut down gracefully"),
        Err(_) => tracing::warn!(
            "Shutdown timed out after {:?}, forcing exit",
            shutdown_timeout
        ),
    }

    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Install the Prometheus recorder; returns how to attach it to the HTTP state
#[cfg(feature = "metrics-prometheus")]
fn init_metrics(cli: &Cli) -> anyhow::Result<impl FnOnce(HttpState) -> HttpState> {
    let handle = if cli.metrics {
        Some(
            convoy_cluster::observability::init_prometheus_recorder()
                .map_err(|e| anyhow::anyhow!(e))?,
        )
    } else {
        None
    };
    Ok(move |state: HttpState| match handle {
        Some(handle) => state.with_metrics(handle),
        None => state,
    })
}

#[cfg(not(feature = "metrics-prometheus"))]
fn init_metrics(cli: &Cli) -> anyhow::Result<impl FnOnce(HttpState) -> HttpState> {
    if cli.metrics {
        tracing::warn!("built without metrics-prometheus, /metrics is not served");
    }
    Ok(|state: HttpState| state)
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn print_banner(cli: &Cli, instance_id: &str) {
    eprintln!(
        r#"
  convoy control plane

  Instance:      {}
  Storage:       {:?}
  Subscription:  {}
  Event filter:  {:?}
  HTTP:          {}
"#,
        instance_id, cli.storage, cli.subscription_mode, cli.event_filter, cli.http_bind
    );
}
