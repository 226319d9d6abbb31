//! keeld — the Keel scheduler daemon.
//!
//! # Usage
//!
//! ```text
//! keeld --master master.local:5050 \
//!       --zk-endpoints http://etcd-1:2379,http://etcd-2:2379 \
//!       --persistence-zk-path /keel/state
//! ```

use clap::Parser;
use keeld::Cli;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keeld=debug,keel=debug")),
        )
        .init();

    let options = Cli::parse().into_options()?;
    info!(?options, "keel scheduler starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for shutdown signal");
                // Keep the sender alive so the daemon is not stopped.
                std::future::pending::<()>().await;
            }
        }
    });

    keeld::run(options, shutdown_rx).await
}
