//! In-process coordination service.
//!
//! `LocalEnsemble` implements the full [`CoordinationClient`] contract in
//! memory: versioned nodes, ephemeral and sequential nodes, sessions with
//! timeouts, and change notifications. Several clients connected to the
//! same ensemble behave like several processes sharing one service, which
//! makes it the backing store for single-host deployments (`memory://`
//! endpoints) and for failover tests.
//!
//! Sessions stay alive while their client heartbeats. A client can be cut
//! off with [`LocalClient::partition`]; once the session timeout elapses
//! without a [`LocalClient::heal`], the session expires exactly as it would
//! on a real ensemble.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::{
    CoordinationClient, CreateMode, NodeStat, SessionId, SessionState, Version, parent_of,
    validate_path,
};
use crate::error::{CoordError, CoordResult};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: Version,
    owner: Option<SessionId>,
    /// Global creation order.
    created: u64,
    /// Counter for sequential children.
    child_seq: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<SessionId>, created: u64) -> Self {
        Self {
            data,
            version: 0,
            owner,
            created,
            child_seq: 0,
        }
    }
}

#[derive(Debug)]
struct Session {
    state: watch::Sender<SessionState>,
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<SessionId, Session>,
    next_session: u64,
    next_created: u64,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Drop a session and everything it owns. Returns false if the session
    /// was already gone.
    fn end_session(&self, id: SessionId, outcome: SessionState) -> bool {
        let removed = {
            let mut inner = self.lock();
            let Some(session) = inner.sessions.remove(&id) else {
                return false;
            };
            inner.nodes.retain(|_, node| node.owner != Some(id));
            session
        };
        removed.state.send_replace(outcome);
        self.notify();
        true
    }
}

/// An in-memory coordination service shared by any number of clients.
#[derive(Debug, Clone)]
pub struct LocalEnsemble {
    shared: Arc<Shared>,
}

static NAMED: OnceLock<Mutex<HashMap<String, LocalEnsemble>>> = OnceLock::new();

impl LocalEnsemble {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None, 0));
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    nodes,
                    sessions: HashMap::new(),
                    next_session: 1,
                    next_created: 1,
                }),
                changes,
            }),
        }
    }

    /// The process-wide ensemble registered under `name`, created on first
    /// use. Backs `memory://<name>` endpoints.
    pub fn named(name: &str) -> Self {
        let registry = NAMED.get_or_init(Default::default);
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry
            .entry(name.to_string())
            .or_insert_with(LocalEnsemble::new)
            .clone()
    }

    /// Open a new session. Must be called from within a Tokio runtime.
    pub fn connect(&self, session_timeout: Duration) -> LocalClient {
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        let id = {
            let mut inner = self.shared.lock();
            let id = SessionId(inner.next_session);
            inner.next_session += 1;
            inner.sessions.insert(id, Session { state: state_tx });
            id
        };

        let (partition_tx, partition_rx) = watch::channel(false);
        tokio::spawn(keep_alive(
            Arc::downgrade(&self.shared),
            id,
            session_timeout,
            partition_rx,
        ));

        debug!(session = %id, timeout = ?session_timeout, "local session opened");
        LocalClient {
            ensemble: self.clone(),
            id,
            timeout: session_timeout,
            events: state_rx,
            partition: partition_tx,
        }
    }

    /// Expire a session immediately, as if its timeout had elapsed.
    pub fn expire_session(&self, id: SessionId) -> bool {
        let expired = self.shared.end_session(id, SessionState::Expired);
        if expired {
            info!(session = %id, "local session expired");
        }
        expired
    }

    /// Whether a node currently exists.
    pub fn exists(&self, path: &str) -> bool {
        self.shared.lock().nodes.contains_key(path)
    }
}

impl Default for LocalEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_until(rx: &mut watch::Receiver<bool>, value: bool) -> bool {
    rx.wait_for(|v| *v == value).await.is_ok()
}

/// Emulates heartbeating: the session only expires once the client has been
/// partitioned for a full timeout.
async fn keep_alive(
    shared: Weak<Shared>,
    id: SessionId,
    timeout: Duration,
    mut partitioned: watch::Receiver<bool>,
) {
    loop {
        if !wait_until(&mut partitioned, true).await {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if let Some(shared) = shared.upgrade() {
                    if shared.end_session(id, SessionState::Expired) {
                        info!(session = %id, "local session expired after missed heartbeats");
                    }
                }
                return;
            }
            healed = wait_until(&mut partitioned, false) => {
                if !healed {
                    return;
                }
                debug!(session = %id, "local session heartbeats resumed");
            }
        }
    }
}

/// A session against a [`LocalEnsemble`].
#[derive(Debug)]
pub struct LocalClient {
    ensemble: LocalEnsemble,
    id: SessionId,
    timeout: Duration,
    events: watch::Receiver<SessionState>,
    partition: watch::Sender<bool>,
}

impl LocalClient {
    /// Stop heartbeating. The session expires after its timeout unless
    /// [`heal`](Self::heal) is called first.
    pub fn partition(&self) {
        self.partition.send_replace(true);
    }

    /// Resume heartbeating.
    pub fn heal(&self) {
        self.partition.send_replace(false);
    }

    fn live(&self) -> CoordResult<MutexGuard<'_, Inner>> {
        let inner = self.ensemble.shared.lock();
        if inner.sessions.contains_key(&self.id) {
            Ok(inner)
        } else {
            Err(CoordError::SessionExpired)
        }
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        self.ensemble.shared.end_session(self.id, SessionState::Closed);
    }
}

#[async_trait]
impl CoordinationClient for LocalClient {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn session_timeout(&self) -> Duration {
        self.timeout
    }

    fn session_events(&self) -> watch::Receiver<SessionState> {
        self.events.clone()
    }

    async fn get_data(&self, path: &str) -> CoordResult<Option<(Vec<u8>, NodeStat)>> {
        validate_path(path)?;
        let inner = self.live()?;
        Ok(inner.nodes.get(path).map(|node| {
            (
                node.data.clone(),
                NodeStat {
                    version: node.version,
                },
            )
        }))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected: Option<Version>,
    ) -> CoordResult<NodeStat> {
        validate_path(path)?;
        let stat = {
            let mut inner = self.live()?;
            let node = inner
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            if let Some(expected) = expected {
                if expected != node.version {
                    return Err(CoordError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data.to_vec();
            node.version += 1;
            NodeStat {
                version: node.version,
            }
        };
        self.ensemble.shared.notify();
        Ok(stat)
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        validate_path(path)?;
        let parent = parent_of(path).ok_or_else(|| CoordError::NodeExists(path.to_string()))?;
        let actual = {
            let mut inner = self.live()?;
            let created = inner.next_created;
            let parent_node = inner
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordError::NoNode(parent.to_string()))?;
            let seq = parent_node.child_seq;
            parent_node.child_seq += 1;

            let actual = match mode {
                CreateMode::EphemeralSequential => format!("{path}{seq:010}"),
                _ => path.to_string(),
            };
            if inner.nodes.contains_key(&actual) {
                return Err(CoordError::NodeExists(actual));
            }
            let owner = mode.is_ephemeral().then_some(self.id);
            inner
                .nodes
                .insert(actual.clone(), Node::new(data.to_vec(), owner, created));
            inner.next_created += 1;
            actual
        };
        self.ensemble.shared.notify();
        debug!(path = %actual, ?mode, session = %self.id, "node created");
        Ok(actual)
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> CoordResult<()> {
        validate_path(path)?;
        {
            let mut inner = self.live()?;
            let node = inner
                .nodes
                .get(path)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            if let Some(expected) = expected {
                if expected != node.version {
                    return Err(CoordError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            if inner.nodes.keys().any(|k| parent_of(k) == Some(path)) {
                return Err(CoordError::NotEmpty(path.to_string()));
            }
            inner.nodes.remove(path);
        }
        self.ensemble.shared.notify();
        Ok(())
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        validate_path(path)?;
        let inner = self.live()?;
        if !inner.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let mut kids: Vec<(u64, String)> = inner
            .nodes
            .iter()
            .filter(|(k, _)| k.as_str() != "/" && parent_of(k) == Some(path))
            .filter_map(|(k, node)| {
                k.rsplit('/')
                    .next()
                    .map(|name| (node.created, name.to_string()))
            })
            .collect();
        kids.sort();
        Ok(kids.into_iter().map(|(_, name)| name).collect())
    }

    async fn watch(&self, path: &str) -> CoordResult<watch::Receiver<u64>> {
        validate_path(path)?;
        let _inner = self.live()?;
        Ok(self.ensemble.shared.changes.subscribe())
    }

    async fn close(&self) -> CoordResult<()> {
        if self.ensemble.shared.end_session(self.id, SessionState::Closed) {
            debug!(session = %self.id, "local session closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn create_get_and_versioned_set() {
        let ensemble = LocalEnsemble::new();
        let client = ensemble.connect(TIMEOUT);

        client
            .create("/state", b"a", CreateMode::Persistent)
            .await
            .unwrap();
        let (data, stat) = client.get_data("/state").await.unwrap().unwrap();
        assert_eq!(data, b"a");
        assert_eq!(stat.version, 0);

        let stat = client.set_data("/state", b"b", Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);

        let err = client.set_data("/state", b"c", Some(0)).await.unwrap_err();
        assert_eq!(
            err,
            CoordError::BadVersion {
                path: "/state".to_string(),
                expected: 0,
                actual: 1,
            }
        );
        let (data, _) = client.get_data("/state").await.unwrap().unwrap();
        assert_eq!(data, b"b");
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let ensemble = LocalEnsemble::new();
        let client = ensemble.connect(TIMEOUT);

        let err = client
            .create("/a/b", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::NoNode("/a".to_string()));

        client.create_parents("/a/b/c").await.unwrap();
        assert!(ensemble.exists("/a"));
        assert!(ensemble.exists("/a/b"));
        assert!(!ensemble.exists("/a/b/c"));
        // Idempotent.
        client.create_parents("/a/b/c").await.unwrap();
    }

    #[tokio::test]
    async fn sequential_children_in_creation_order() {
        let ensemble = LocalEnsemble::new();
        let client = ensemble.connect(TIMEOUT);
        client.create("/group", b"", CreateMode::Persistent).await.unwrap();

        let first = client
            .create("/group/member_", b"1", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = client
            .create("/group/member_", b"2", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/group/member_0000000000");
        assert_eq!(second, "/group/member_0000000001");

        let kids = client.children("/group").await.unwrap();
        assert_eq!(kids, vec!["member_0000000000", "member_0000000001"]);
    }

    #[tokio::test]
    async fn expiry_removes_ephemerals_and_rejects_calls() {
        let ensemble = LocalEnsemble::new();
        let owner = ensemble.connect(TIMEOUT);
        let observer = ensemble.connect(TIMEOUT);

        owner.create("/lock", b"", CreateMode::Ephemeral).await.unwrap();
        owner.create("/kept", b"", CreateMode::Persistent).await.unwrap();
        assert!(ensemble.expire_session(owner.session_id()));

        assert_eq!(*owner.session_events().borrow(), SessionState::Expired);
        assert!(observer.get_data("/lock").await.unwrap().is_none());
        assert!(observer.get_data("/kept").await.unwrap().is_some());
        assert_eq!(
            owner.get_data("/kept").await.unwrap_err(),
            CoordError::SessionExpired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn partition_expires_after_timeout() {
        let ensemble = LocalEnsemble::new();
        let client = ensemble.connect(TIMEOUT);
        client.create("/eph", b"", CreateMode::Ephemeral).await.unwrap();

        let mut events = client.session_events();
        client.partition();
        events
            .wait_for(|s| *s == SessionState::Expired)
            .await
            .unwrap();
        assert!(!ensemble.exists("/eph"));
    }

    #[tokio::test(start_paused = true)]
    async fn healed_partition_keeps_session() {
        let ensemble = LocalEnsemble::new();
        let client = ensemble.connect(TIMEOUT);

        client.partition();
        tokio::time::sleep(TIMEOUT / 2).await;
        client.heal();
        tokio::time::sleep(TIMEOUT * 2).await;

        assert_eq!(*client.session_events().borrow(), SessionState::Connected);
    }

    #[tokio::test]
    async fn delete_checks_version_and_children() {
        let ensemble = LocalEnsemble::new();
        let client = ensemble.connect(TIMEOUT);
        client.create_parents("/p/c").await.unwrap();
        client.create("/p/c", b"", CreateMode::Persistent).await.unwrap();

        assert_eq!(
            client.delete("/p", None).await.unwrap_err(),
            CoordError::NotEmpty("/p".to_string())
        );
        assert!(matches!(
            client.delete("/p/c", Some(3)).await.unwrap_err(),
            CoordError::BadVersion { .. }
        ));
        client.delete("/p/c", Some(0)).await.unwrap();
        client.delete("/p", None).await.unwrap();
        assert!(!ensemble.exists("/p"));
    }

    #[tokio::test]
    async fn watch_fires_on_change() {
        let ensemble = LocalEnsemble::new();
        let client = ensemble.connect(TIMEOUT);
        let changes = client.watch("/").await.unwrap();

        client.create("/x", b"", CreateMode::Persistent).await.unwrap();
        assert!(changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn named_ensembles_are_shared() {
        let a = LocalEnsemble::named("shared-test");
        let b = LocalEnsemble::named("shared-test");
        let client = a.connect(TIMEOUT);
        client.create("/named", b"", CreateMode::Persistent).await.unwrap();
        assert!(b.exists("/named"));
    }
}
