/*!
# HookRelay Broker

This is the broker executable for HookRelay, a delivery reliability engine
for outbound webhooks.

The broker owns the single retry queue of a deployment:
- Restores pending deliveries from the SQLite store on startup
- Runs the scheduler that retries due deliveries and sweeps old records
- Exposes a gRPC API for enqueueing failures and operating the queue
*/

mod config;
mod service;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hookrelay_core::sqlite::SqliteStore;
use hookrelay_core::{HttpExecutor, RetryQueue, Scheduler};

use crate::config::Settings;
use crate::service::proto::hook_relay_server::HookRelayServer;
use crate::service::HookRelayService;

/// HookRelay Broker - Webhook Delivery Retries
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker
    Start {
        /// Path to config file
        #[arg(long, short, default_value = "config/broker.yml")]
        config: String,

        /// Host to bind to (overrides the config file)
        #[arg(long, short = 'H')]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, host, port } => {
            let mut settings = Settings::load(&config)
                .with_context(|| format!("failed to load settings from {config}"))?;
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            start_broker(settings).await?;
        }
    }

    Ok(())
}

async fn start_broker(settings: Settings) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("invalid listen address")?;

    let store = SqliteStore::connect(&settings.store.database_url)
        .await
        .with_context(|| format!("failed to open store {}", settings.store.database_url))?;
    let executor = HttpExecutor::new(settings.executor.timeout())?;

    let queue = Arc::new(RetryQueue::new(
        Arc::new(store),
        Arc::new(executor),
        settings.retry.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(queue.clone(), settings.scheduler.clone()));

    match scheduler.recover(Utc::now()).await {
        Ok(restored) => info!(restored, "Recovered pending deliveries"),
        Err(e) => warn!(error = %e, "Recovery failed, starting with an empty queue"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = scheduler.spawn(shutdown_rx);

    info!("Starting HookRelay broker on {}", addr);

    let served = Server::builder()
        .add_service(HookRelayServer::new(HookRelayService::new(queue)))
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await;

    let _ = shutdown_tx.send(true);
    handle.join().await;
    info!("HookRelay broker stopped");

    served?;
    Ok(())
}
