/// Audit Consumer Entry Point
///
/// Joins the Kafka consumer group for the configured CDC topics and appends
/// every change event to the immudb audit ledger until SIGINT/SIGTERM.
use anyhow::{Context, Result};
use audit_consumer::config::{Config, LogFormat};
use audit_consumer::services::consumer::{ConnectionSupervisor, KafkaConnector, WriteSettings};
use audit_consumer::services::ledger::ImmudbConnector;
use resilience::{ExponentialBackoff, FixedBackoff};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);

    info!(
        brokers = %config.kafka.brokers,
        topics = ?config.kafka.topics,
        group_id = %config.kafka.group_id,
        ledger = ?config.ledger,
        write_policy = ?config.write_policy,
        "Starting audit-consumer"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let write = WriteSettings {
        timeout: config.write_timeout,
        policy: config.write_policy,
        backoff: Arc::new(ExponentialBackoff {
            initial_backoff: Duration::from_millis(200),
            max_backoff: config.retry_delay,
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }),
    };

    let supervisor = ConnectionSupervisor::new(
        KafkaConnector::new(config.kafka.clone()),
        ImmudbConnector::new(config.ledger.clone()),
        Arc::new(FixedBackoff::new(config.retry_delay)),
        write,
        shutdown_rx,
    );

    supervisor
        .run()
        .await
        .context("Audit consumer stopped with an error")?;

    info!("audit-consumer shut down");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,audit_consumer=debug".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

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
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully, finishing in-flight messages...");
}
