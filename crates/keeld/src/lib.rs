//! keeld — the Keel scheduler daemon.
//!
//! Wires coordination, leader election, persistence and framework
//! registration together:
//!
//! 1. parse flags and the optional TOML file into [`SchedulerOptions`];
//! 2. connect to the coordination service (if configured) and campaign;
//! 3. as leader, recover persisted state and (re)register with the master;
//! 4. run until leadership is lost or shutdown is requested.

pub mod bootstrap;
pub mod config;
pub mod error;

use tokio::sync::watch;
use tracing::{info, warn};

pub use bootstrap::{Leader, Scheduler};
pub use config::{Cli, KeelConfig, SchedulerOptions};
pub use error::{BootstrapError, BootstrapResult};

/// Run the daemon until `shutdown` flips to `true` or leadership is lost.
///
/// Losing leadership is an error: the process must restart and campaign
/// again with fresh state.
pub async fn run(options: SchedulerOptions, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let scheduler = Scheduler::bootstrap(options).await?;

    let Some(leader) = scheduler.lead(shutdown.clone()).await? else {
        info!("shutdown requested before leadership was acquired");
        scheduler.close().await;
        return Ok(());
    };
    info!(
        framework_id = %leader.connection.framework_id,
        resumed = leader.connection.resumed,
        master = %leader.connection.master,
        "scheduler active"
    );

    let mut shutdown = shutdown;
    let stop_requested = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    };
    let outcome = tokio::select! {
        _ = leader.leadership.lost() => {
            warn!("leadership lost, stopping scheduler");
            Err(anyhow::anyhow!("leadership lost"))
        }
        () = stop_requested => {
            info!("shutting down");
            leader.leadership.resign().await.map_err(anyhow::Error::from)
        }
    };

    scheduler.close().await;
    info!("keel scheduler stopped");
    outcome
}
