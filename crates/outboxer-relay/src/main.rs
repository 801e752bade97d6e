//! Outboxer binary entry point.
//!
//! Usage: outboxer [--config <path>]
//!
//! Relays messages from a PostgreSQL outbox table to a NATS JetStream
//! subject until interrupted, then drains in-flight work and exits.

mod config;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use outboxer::{ClaimStore, Relay};
use outboxer_nats::NatsSink;
use outboxer_postgres::PgClaimStore;
use std::process::ExitCode;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;

/// Outboxer: transactional outbox relay.
#[derive(Parser, Debug)]
#[command(name = "outboxer")]
#[command(about = "Relays transactional outbox rows from PostgreSQL to NATS JetStream")]
struct Args {
    /// Path to the YAML configuration file. A missing file is not an error;
    /// defaults and OUTBOXER__* environment variables apply.
    #[arg(long, short, env = "OUTBOXER_CONFIG", default_value = "./config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ServiceConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration from {}: {err}", args.config);
            return ExitCode::FAILURE;
        }
    };

    telemetry::init(&config.log);
    info!(config = %args.config, "outboxer starting");

    match run(config).await {
        Ok(()) => {
            info!("outboxer stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "outboxer stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServiceConfig) -> Result<()> {
    let store = PgClaimStore::connect(&config.source)
        .await
        .context("failed to connect claim store")?;
    if config.source.ensure_schema {
        close_on_error(&store, store.ensure_schema().await).await?;
    }

    let sink = close_on_error(
        &store,
        NatsSink::connect_with(&config.sink)
            .await
            .context("failed to connect message sink"),
    )
    .await?;

    let handle = Relay::builder(store, sink)
        .config(config.relay)
        .build()?
        .start();

    tokio::select! {
        signal = shutdown_signal() => {
            signal.context("failed to listen for shutdown signals")?;
            info!("received shutdown signal");
        }
        _ = handle.stopped() => {
            warn!("relay stopped without a shutdown signal");
        }
    }

    let stats = handle.shutdown().await?;
    info!(
        claimed = stats.claimed,
        published = stats.published,
        publish_failed = stats.publish_failed,
        deleted = stats.deleted,
        unlocked = stats.unlocked,
        swept = stats.swept,
        "relay drained"
    );
    Ok(())
}

/// Close `store` if a startup step after connecting it failed.
async fn close_on_error<T>(store: &impl ClaimStore, result: Result<T>) -> Result<T> {
    if result.is_err() {
        if let Err(close_err) = store.close().await {
            warn!(error = %format!("{close_err:#}"), "failed to close claim store");
        }
    }
    result
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outboxer_testing::InMemoryClaimStore;

    #[test]
    fn config_path_defaults_to_working_directory() {
        let args = Args::try_parse_from(["outboxer"]).unwrap();
        assert_eq!(args.config, "./config.yaml");

        let args = Args::try_parse_from(["outboxer", "--config", "/etc/outboxer.yaml"]).unwrap();
        assert_eq!(args.config, "/etc/outboxer.yaml");
    }

    #[tokio::test]
    async fn failed_startup_step_closes_the_store() {
        let store = InMemoryClaimStore::new();

        let result: Result<()> = close_on_error(&store, Err(anyhow::anyhow!("schema error"))).await;

        assert!(result.is_err());
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn successful_startup_step_keeps_the_store_open() {
        let store = InMemoryClaimStore::new();

        let value = close_on_error(&store, Ok(7)).await.unwrap();

        assert_eq!(value, 7);
        assert!(!store.is_closed());
    }
}
