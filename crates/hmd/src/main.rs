//! hmd — the HM health manager daemon.
//!
//! Assembles the health manager subsystems:
//! - State store (redb)
//! - Desired state fetcher (bulk API polling)
//! - Heartbeat book
//! - Crash/backoff analyzer
//!
//! # Usage
//!
//! ```text
//! hmd fetch-desired --config /etc/hm/hm.toml
//! hmd standalone --config /etc/hm/hm.toml
//! ```

mod standalone;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use hm_core::{HmConfig, LocalBus, SystemClock};
use hm_fetcher::{DesiredStateFetcher, FetcherSettings, HyperHttpClient};
use hm_state::StateStore;

/// Bound on waiting for bulk API response headers.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "hmd", about = "HM health manager daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single desired state fetch cycle and exit.
    FetchDesired {
        /// Path to the TOML configuration.
        #[arg(long)]
        config: PathBuf,
    },
    /// Run every subsystem in one process until interrupted.
    Standalone {
        /// Path to the TOML configuration.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hmd=debug,hm=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::FetchDesired { config } => {
            let config = HmConfig::from_file(&config)?;
            fetch_desired(config).await
        }
        Command::Standalone { config } => {
            let config = HmConfig::from_file(&config)?;
            standalone::run_standalone(config).await
        }
    }
}

async fn fetch_desired(config: HmConfig) -> anyhow::Result<()> {
    let store = standalone::open_store(&config)?;
    let bus = LocalBus::new();
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let responder = standalone::spawn_credentials_responder(&config, &bus, shutdown_rx);

    let fetcher = build_fetcher(&config, &bus, &store);
    let result = fetcher.fetch_once().await;

    if let Some(handle) = responder {
        handle.abort();
    }

    if result.success {
        info!(stored = result.stored, "desired state fetched");
        Ok(())
    } else {
        match result.error {
            Some(e) => Err(anyhow::Error::new(e)),
            None => anyhow::bail!("{}", result.message),
        }
    }
}

fn build_fetcher(config: &HmConfig, bus: &LocalBus, store: &StateStore) -> DesiredStateFetcher {
    DesiredStateFetcher::new(
        Arc::new(bus.clone()),
        store.clone(),
        Arc::new(HyperHttpClient::new(HTTP_TIMEOUT)),
        Arc::new(store.clone()),
        Arc::new(SystemClock),
        FetcherSettings::from_config(config),
    )
}
