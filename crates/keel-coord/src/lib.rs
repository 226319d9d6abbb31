//! keel-coord — coordination service access and leader election for Keel.
//!
//! # Architecture
//!
//! - **`client`** — the [`CoordinationClient`] contract (versioned nodes,
//!   ephemeral/sequential nodes, sessions, watches) and the [`Coordination`]
//!   switch between coordinated and single-node operation
//! - **`local`** — [`LocalEnsemble`], an in-process implementation
//! - **`etcd`** — [`EtcdClient`], lease-backed implementation (feature `etcd`)
//! - **`election`** — [`SingletonService`] campaigns and [`Leadership`]
//!   handles

pub mod client;
pub mod election;
pub mod error;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use client::{
    Coordination, CoordinationClient, CreateMode, NodeStat, SessionId, SessionState, Version,
};
pub use election::{Leadership, SingletonService};
pub use error::{CoordError, CoordResult};
#[cfg(feature = "etcd")]
pub use etcd::EtcdClient;
pub use local::{LocalClient, LocalEnsemble};

/// Scheme selecting the in-process ensemble.
pub const MEMORY_SCHEME: &str = "memory://";

impl Coordination {
    /// Connect to the coordination service named by `endpoints`.
    ///
    /// An empty list disables coordination. `memory://<name>` joins the
    /// process-wide [`LocalEnsemble`] of that name; anything else is handed
    /// to etcd.
    pub async fn connect(endpoints: &[String], session_timeout: Duration) -> CoordResult<Self> {
        let Some(first) = endpoints.first() else {
            info!("coordination endpoints not specified, coordination disabled");
            return Ok(Coordination::Disabled);
        };

        if let Some(name) = first.strip_prefix(MEMORY_SCHEME) {
            if endpoints.len() > 1 {
                return Err(CoordError::InvalidPath(format!(
                    "{MEMORY_SCHEME} endpoints cannot be mixed: {endpoints:?}"
                )));
            }
            info!(ensemble = %name, "using in-process coordination ensemble");
            let client = LocalEnsemble::named(name).connect(session_timeout);
            return Ok(Coordination::Enabled(Arc::new(client)));
        }

        connect_remote(endpoints, session_timeout).await
    }
}

#[cfg(feature = "etcd")]
async fn connect_remote(endpoints: &[String], session_timeout: Duration) -> CoordResult<Coordination> {
    let client = EtcdClient::connect(endpoints, session_timeout).await?;
    Ok(Coordination::Enabled(Arc::new(client)))
}

#[cfg(not(feature = "etcd"))]
async fn connect_remote(endpoints: &[String], _session_timeout: Duration) -> CoordResult<Coordination> {
    Err(CoordError::ConnectionLoss(format!(
        "no coordination backend for {endpoints:?}: built without the `etcd` feature"
    )))
}
