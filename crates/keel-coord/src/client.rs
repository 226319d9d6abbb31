//! The coordination-service client contract.
//!
//! Modelled on a hierarchical namespace of versioned nodes: every node has
//! a path (`/a/b/c`), a byte payload and a version that starts at `0` on
//! creation and increments on every `set_data`. Ephemeral nodes are bound
//! to the creating session and vanish when it expires or closes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{CoordError, CoordResult};

/// Node version (0 on creation).
pub type Version = i64;

/// Identifier of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Metadata returned alongside node data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub version: Version,
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing suffix appended to the
    /// requested path.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }
}

/// Lifecycle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// The service stopped hearing from this client for longer than the
    /// session timeout. All its ephemeral nodes are gone.
    Expired,
    /// Closed by the client.
    Closed,
}

/// Client for a distributed coordination service.
///
/// All operations may block on network I/O and fail with
/// [`CoordError::ConnectionLoss`]. None of them retry internally.
#[async_trait]
pub trait CoordinationClient: Send + Sync + fmt::Debug {
    /// This client's session.
    fn session_id(&self) -> SessionId;

    /// How long the service keeps the session alive without heartbeats.
    fn session_timeout(&self) -> Duration;

    /// Session state changes. The current value is readable immediately.
    fn session_events(&self) -> watch::Receiver<SessionState>;

    /// Read a node. `None` if it does not exist.
    async fn get_data(&self, path: &str) -> CoordResult<Option<(Vec<u8>, NodeStat)>>;

    /// Replace a node's payload.
    ///
    /// With `expected = Some(v)` the write only succeeds when the node is
    /// at version `v`, otherwise [`CoordError::BadVersion`]. With `None`
    /// the write is unconditional. Fails with [`CoordError::NoNode`] if the
    /// node does not exist.
    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected: Option<Version>,
    ) -> CoordResult<NodeStat>;

    /// Create a node and return its actual path (which differs from `path`
    /// for sequential nodes). The parent must exist.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String>;

    /// Delete a node, optionally conditional on its version.
    async fn delete(&self, path: &str, expected: Option<Version>) -> CoordResult<()>;

    /// Names (not full paths) of a node's direct children, in creation
    /// order.
    async fn children(&self, path: &str) -> CoordResult<Vec<String>>;

    /// Subscribe to changes of `path` and its direct children.
    ///
    /// The receiver's value is an opaque change counter; it is bumped at
    /// least once after every change. Spurious wake-ups are allowed, so
    /// callers must re-read the state they care about.
    async fn watch(&self, path: &str) -> CoordResult<watch::Receiver<u64>>;

    /// End the session, removing its ephemeral nodes.
    async fn close(&self) -> CoordResult<()>;

    /// Create every missing ancestor of `path` as an empty persistent node.
    async fn create_parents(&self, path: &str) -> CoordResult<()> {
        validate_path(path)?;
        for ancestor in ancestors(path) {
            match self.create(&ancestor, &[], CreateMode::Persistent).await {
                Ok(_) | Err(CoordError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Whether coordination is configured for this process.
///
/// When disabled, leader election and coordinated persistence are
/// unavailable and the process is implicitly authoritative.
#[derive(Debug, Clone)]
pub enum Coordination {
    Disabled,
    Enabled(Arc<dyn CoordinationClient>),
}

impl Coordination {
    pub fn client(&self) -> Option<&Arc<dyn CoordinationClient>> {
        match self {
            Coordination::Disabled => None,
            Coordination::Enabled(client) => Some(client),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Coordination::Enabled(_))
    }
}

/// Check that `path` is absolute, has no empty segments and no trailing
/// slash (except the root itself).
pub fn validate_path(path: &str) -> CoordResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(CoordError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Parent of a validated path. The root's parent is `None`.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Proper ancestors of a validated path, shallowest first, excluding the
/// root.
fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = parent_of(path);
    while let Some(p) = current {
        if p == "/" {
            break;
        }
        out.push(p.to_string());
        current = parent_of(p);
    }
    out.reverse();
    out
}
