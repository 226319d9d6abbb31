//! etcd-backed coordination client (feature `etcd`).
//!
//! Maps the node model onto etcd keys:
//! - a session is a lease with TTL = session timeout, kept alive from a
//!   background task; ephemeral nodes are keys attached to that lease;
//! - node versions are etcd per-key versions shifted down by one, so a
//!   freshly created node is at version `0`;
//! - conditional writes are single-key transactions comparing the key
//!   version;
//! - sequential nodes get a session-unique suffix and are ordered by
//!   create revision.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, SortOrder, SortTarget, Txn, TxnOp,
    TxnOpResponse, WatchOptions,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{
    CoordinationClient, CreateMode, NodeStat, SessionId, SessionState, Version, validate_path,
};
use crate::error::{CoordError, CoordResult};

fn conn_loss(e: etcd_client::Error) -> CoordError {
    CoordError::ConnectionLoss(e.to_string())
}

/// A coordination session against an etcd cluster.
pub struct EtcdClient {
    client: Client,
    lease: i64,
    timeout: Duration,
    session: Arc<watch::Sender<SessionState>>,
    sequence: AtomicU64,
    keeper: JoinHandle<()>,
}

impl std::fmt::Debug for EtcdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdClient")
            .field("lease", &self.lease)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EtcdClient {
    /// Connect and open a lease-backed session.
    pub async fn connect(endpoints: &[String], session_timeout: Duration) -> CoordResult<Self> {
        let mut client = Client::connect(endpoints, None).await.map_err(conn_loss)?;
        let ttl = session_timeout.as_secs().max(1) as i64;
        let lease = client.lease_grant(ttl, None).await.map_err(conn_loss)?.id();
        let (mut keeper, mut responses) =
            client.lease_keep_alive(lease).await.map_err(conn_loss)?;

        let (tx, _) = watch::channel(SessionState::Connected);
        let session = Arc::new(tx);
        let session_tx = Arc::clone(&session);
        let interval = (session_timeout / 3).max(Duration::from_millis(200));

        let keeper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease, error = %e, "lease keep-alive failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    Ok(_) => {
                        warn!(lease, "lease expired");
                        break;
                    }
                    Err(e) => {
                        warn!(lease, error = %e, "lease keep-alive stream failed");
                        break;
                    }
                }
            }
            session_tx.send_replace(SessionState::Expired);
        });

        info!(?endpoints, lease, ttl, "etcd session opened");
        Ok(Self {
            client,
            lease,
            timeout: session_timeout,
            session,
            sequence: AtomicU64::new(0),
            keeper,
        })
    }

    fn check_session(&self) -> CoordResult<()> {
        match *self.session.borrow() {
            SessionState::Connected => Ok(()),
            _ => Err(CoordError::SessionExpired),
        }
    }

    /// Outcome of a failed single-key transaction: the key is either gone or
    /// at another version.
    fn failed_compare(
        path: &str,
        expected: Option<Version>,
        responses: Vec<TxnOpResponse>,
    ) -> CoordError {
        let current = responses.into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => get.kvs().first().map(|kv| kv.version() - 1),
            _ => None,
        });
        match (current, expected) {
            (Some(actual), Some(expected)) => CoordError::BadVersion {
                path: path.to_string(),
                expected,
                actual,
            },
            _ => CoordError::NoNode(path.to_string()),
        }
    }

    fn guard(path: &str, expected: Option<Version>) -> Compare {
        match expected {
            Some(v) => Compare::version(path, CompareOp::Equal, v + 1),
            None => Compare::create_revision(path, CompareOp::Greater, 0),
        }
    }
}

impl Drop for EtcdClient {
    fn drop(&mut self) {
        self.keeper.abort();
    }
}

#[async_trait]
impl CoordinationClient for EtcdClient {
    fn session_id(&self) -> SessionId {
        SessionId(self.lease as u64)
    }

    fn session_timeout(&self) -> Duration {
        self.timeout
    }

    fn session_events(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    async fn get_data(&self, path: &str) -> CoordResult<Option<(Vec<u8>, NodeStat)>> {
        validate_path(path)?;
        self.check_session()?;
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(conn_loss)?;
        Ok(resp.kvs().first().map(|kv| {
            (
                kv.value().to_vec(),
                NodeStat {
                    version: kv.version() - 1,
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
        self.check_session()?;
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Self::guard(path, expected)])
            .and_then(vec![TxnOp::put(
                path,
                data.to_vec(),
                Some(PutOptions::new().with_ignore_lease()),
            )])
            .or_else(vec![TxnOp::get(path, None)]);
        let resp = client.txn(txn).await.map_err(conn_loss)?;
        if !resp.succeeded() {
            return Err(Self::failed_compare(path, expected, resp.op_responses()));
        }

        let version = match expected {
            Some(v) => v + 1,
            None => match client.get(path, None).await.map_err(conn_loss)?.kvs().first() {
                Some(kv) => kv.version() - 1,
                None => return Err(CoordError::NoNode(path.to_string())),
            },
        };
        debug!(%path, version, "etcd node updated");
        Ok(NodeStat { version })
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        validate_path(path)?;
        self.check_session()?;
        let actual = match mode {
            CreateMode::EphemeralSequential => {
                let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                format!("{path}{:016x}{seq:04}", self.lease)
            }
            _ => path.to_string(),
        };
        let options = mode
            .is_ephemeral()
            .then(|| PutOptions::new().with_lease(self.lease));

        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                actual.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(actual.as_str(), data.to_vec(), options)]);
        let resp = client.txn(txn).await.map_err(conn_loss)?;
        if !resp.succeeded() {
            return Err(CoordError::NodeExists(actual));
        }
        debug!(path = %actual, ?mode, "etcd node created");
        Ok(actual)
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> CoordResult<()> {
        validate_path(path)?;
        self.check_session()?;
        if !self.children(path).await?.is_empty() {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Self::guard(path, expected)])
            .and_then(vec![TxnOp::delete(path, None)])
            .or_else(vec![TxnOp::get(path, None)]);
        let resp = client.txn(txn).await.map_err(conn_loss)?;
        if !resp.succeeded() {
            return Err(Self::failed_compare(path, expected, resp.op_responses()));
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        validate_path(path)?;
        self.check_session()?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_keys_only()
            .with_sort(SortTarget::Create, SortOrder::Ascend);
        let resp = client
            .get(prefix.as_str(), Some(options))
            .await
            .map_err(conn_loss)?;

        let mut names = Vec::new();
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .map_err(|e| CoordError::ConnectionLoss(e.to_string()))?;
            if let Some(rest) = key.strip_prefix(prefix.as_str()) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.push(rest.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn watch(&self, path: &str) -> CoordResult<watch::Receiver<u64>> {
        validate_path(path)?;
        self.check_session()?;
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(path, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(conn_loss)?;

        let (tx, rx) = watch::channel(0u64);
        let watched = path.to_string();
        tokio::spawn(async move {
            // Keep the watcher alive for as long as anyone listens.
            let mut watcher = watcher;
            loop {
                tokio::select! {
                    msg = stream.message() => match msg {
                        Ok(Some(_)) => {
                            tx.send_modify(|generation| *generation = generation.wrapping_add(1));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(path = %watched, error = %e, "etcd watch failed");
                            break;
                        }
                    },
                    _ = tx.closed() => break,
                }
            }
            let _ = watcher.cancel().await;
        });
        Ok(rx)
    }

    async fn close(&self) -> CoordResult<()> {
        self.keeper.abort();
        let mut client = self.client.clone();
        let revoked = client.lease_revoke(self.lease).await;
        self.session.send_replace(SessionState::Closed);
        revoked.map_err(conn_loss)?;
        info!(lease = self.lease, "etcd session closed");
        Ok(())
    }
}
