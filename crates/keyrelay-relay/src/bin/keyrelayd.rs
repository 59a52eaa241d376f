//! keyrelayd - the key-exchange relay daemon.
//!
//! Usage:
//!   keyrelayd --bind 0.0.0.0:8080 --seed ledger.json
//!
//! Every flag can also be set through a `KEYRELAY_*` environment variable.
//! Logging follows `RUST_LOG` (default `info`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keyrelay_ledger::{LedgerSeed, MemoryLedger};
use keyrelay_relay::{NameDirectory, RelayConfig, RelayServer};

#[derive(Parser)]
#[command(name = "keyrelayd")]
#[command(version)]
#[command(about = "Relay for ledger-gated document key exchange", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "KEYRELAY_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// JSON file with accounts, ledger keys, display names and grants
    #[arg(long, env = "KEYRELAY_SEED")]
    seed: Option<PathBuf>,

    /// Seconds a new connection has to authenticate
    #[arg(long, env = "KEYRELAY_AUTH_TIMEOUT", default_value_t = 5)]
    auth_timeout: u64,

    /// Capacity of the hub command queue
    #[arg(long, env = "KEYRELAY_HUB_CAPACITY", default_value_t = 1024)]
    hub_capacity: usize,

    /// Frames queued per connection before writes to it are dropped
    #[arg(long, env = "KEYRELAY_SEND_QUEUE", default_value_t = 256)]
    send_queue: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let seed = match &cli.seed {
        Some(path) => LedgerSeed::load(path)
            .with_context(|| format!("loading ledger seed {}", path.display()))?,
        None => LedgerSeed::default(),
    };
    let directory: NameDirectory = seed.display_names().collect();
    let ledger: MemoryLedger = seed.into_ledger().await.context("building ledger")?;
    info!(accounts = ledger.account_count(), "ledger ready");

    let config = RelayConfig {
        bind_addr: cli.bind,
        auth_timeout: Duration::from_secs(cli.auth_timeout),
        hub_capacity: cli.hub_capacity,
        send_queue: cli.send_queue,
    };
    let server = RelayServer::bind(config, Arc::new(ledger), Arc::new(directory))
        .await
        .with_context(|| format!("binding {}", cli.bind))?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}
