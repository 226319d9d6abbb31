//! Leader election on top of a [`CoordinationClient`].
//!
//! Every candidate creates an ephemeral sequential member node under the
//! group path; the candidate owning the lowest member is the leader. When
//! the leader's session ends its member vanishes, and the next candidate in
//! line takes over. At most one live session owns the lowest member, so at
//! most one process believes it leads (modulo session-expiry detection
//! latency, which the persistence layer's version checks cover).

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{CoordinationClient, CreateMode, SessionState};
use crate::error::{CoordError, CoordResult};

/// Prefix of member nodes within the group.
pub const MEMBER_PREFIX: &str = "member_";

/// Campaigns for exclusive leadership of a named group.
#[derive(Debug, Clone)]
pub struct SingletonService {
    client: Arc<dyn CoordinationClient>,
    group_path: String,
}

impl SingletonService {
    pub fn new(client: Arc<dyn CoordinationClient>, group_path: impl Into<String>) -> Self {
        Self {
            client,
            group_path: group_path.into(),
        }
    }

    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    /// Advertised endpoints of all current candidates, leader first.
    pub async fn candidates(&self) -> CoordResult<Vec<String>> {
        let mut out = Vec::new();
        for name in self.members().await? {
            let path = format!("{}/{}", self.group_path, name);
            if let Some((data, _)) = self.client.get_data(&path).await? {
                out.push(String::from_utf8_lossy(&data).into_owned());
            }
        }
        Ok(out)
    }

    /// Join the group and wait until this process leads it.
    ///
    /// Returns `Ok(None)` if `shutdown` flips to `true` (or its sender is
    /// dropped) before leadership is acquired; the member node is withdrawn
    /// in that case. Fails if the session ends while waiting.
    pub async fn campaign(
        &self,
        advertise: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> CoordResult<Option<Leadership>> {
        let member_prefix = format!("{}/{}", self.group_path, MEMBER_PREFIX);
        self.client.create_parents(&member_prefix).await?;

        let mut changes = self.client.watch(&self.group_path).await?;
        let mut session = self.client.session_events();
        let member_path = self
            .client
            .create(&member_prefix, advertise.as_bytes(), CreateMode::EphemeralSequential)
            .await?;
        let member_name = member_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        info!(group = %self.group_path, member = %member_name, %advertise, "joined leader election");

        loop {
            if *shutdown.borrow() {
                self.withdraw(&member_path).await;
                return Ok(None);
            }

            let members = self.members().await?;
            match members.iter().position(|m| *m == member_name) {
                None => {
                    warn!(member = %member_name, "member node vanished while campaigning");
                    return Err(CoordError::NoNode(member_path));
                }
                Some(0) => {
                    info!(group = %self.group_path, member = %member_name, "acquired leadership");
                    return Ok(Some(Leadership::claimed(
                        Arc::clone(&self.client),
                        member_path,
                    )));
                }
                Some(ahead) => {
                    debug!(member = %member_name, ahead, "waiting for leadership");
                }
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(CoordError::ConnectionLoss("watch closed".to_string()));
                    }
                }
                changed = session.changed() => {
                    let state = *session.borrow_and_update();
                    if changed.is_err() || state != SessionState::Connected {
                        warn!(?state, "session ended while campaigning");
                        return Err(CoordError::SessionExpired);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        self.withdraw(&member_path).await;
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn members(&self) -> CoordResult<Vec<String>> {
        let children = self.client.children(&self.group_path).await?;
        Ok(children
            .into_iter()
            .filter(|name| name.starts_with(MEMBER_PREFIX))
            .collect())
    }

    async fn withdraw(&self, member_path: &str) {
        match self.client.delete(member_path, None).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {
                info!(member = %member_path, "withdrew from leader election");
            }
            Err(e) => warn!(member = %member_path, error = %e, "failed to withdraw candidacy"),
        }
    }
}

#[derive(Debug)]
struct Claim {
    client: Arc<dyn CoordinationClient>,
    member_path: String,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let monitor = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = monitor {
            handle.abort();
        }
    }
}

/// Handle on this process's authority.
///
/// Cheap to clone; all clones observe the same state. Once leadership is
/// lost it is never regained through the same handle: a new campaign is
/// required.
#[derive(Debug, Clone)]
pub struct Leadership {
    state: Arc<watch::Sender<bool>>,
    claim: Option<Arc<Claim>>,
}

impl Leadership {
    /// Leadership for a process running without coordination. Always
    /// leader; [`resign`](Self::resign) is a no-op.
    pub fn implicit() -> Self {
        let (tx, _) = watch::channel(true);
        Self {
            state: Arc::new(tx),
            claim: None,
        }
    }

    fn claimed(client: Arc<dyn CoordinationClient>, member_path: String) -> Self {
        let (tx, _) = watch::channel(true);
        let state = Arc::new(tx);
        let monitor = tokio::spawn(monitor(
            Arc::clone(&client),
            member_path.clone(),
            Arc::clone(&state),
        ));
        Self {
            state,
            claim: Some(Arc::new(Claim {
                client,
                member_path,
                monitor: Mutex::new(Some(monitor)),
            })),
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.state.borrow()
    }

    /// Precondition check for authoritative writes.
    pub fn ensure_leader(&self) -> CoordResult<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(CoordError::NotLeader)
        }
    }

    /// Receiver tracking whether this process is still leader.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Resolves once leadership is lost. Never resolves for implicit
    /// leadership.
    pub async fn lost(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|leader| !*leader).await;
    }

    /// The member node backing this claim, if any.
    pub fn member_path(&self) -> Option<&str> {
        self.claim.as_ref().map(|c| c.member_path.as_str())
    }

    /// Step down voluntarily, letting the next candidate take over.
    pub async fn resign(&self) -> CoordResult<()> {
        let Some(claim) = &self.claim else {
            return Ok(());
        };
        if let Some(handle) = claim
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.state.send_replace(false);
        match claim.client.delete(&claim.member_path, None).await {
            Ok(()) | Err(CoordError::NoNode(_)) | Err(CoordError::SessionExpired) => {
                info!(member = %claim.member_path, "resigned leadership");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Flip the leadership flag off when the session ends or the member node
/// disappears.
async fn monitor(
    client: Arc<dyn CoordinationClient>,
    member_path: String,
    state: Arc<watch::Sender<bool>>,
) {
    let mut session = client.session_events();
    let mut changes = match client.watch(&member_path).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(error = %e, "cannot watch leadership claim");
            state.send_replace(false);
            return;
        }
    };

    loop {
        let session_state = *session.borrow_and_update();
        if session_state != SessionState::Connected {
            warn!(member = %member_path, ?session_state, "leadership lost: session ended");
            break;
        }
        match client.get_data(&member_path).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(member = %member_path, "leadership lost: claim removed");
                break;
            }
            Err(e) => {
                warn!(member = %member_path, error = %e, "leadership lost");
                break;
            }
        }

        tokio::select! {
            changed = session.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    state.send_replace(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalEnsemble;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const GROUP: &str = "/keel/scheduler";

    #[tokio::test]
    async fn implicit_leadership_is_always_leader() {
        let leadership = Leadership::implicit();
        assert!(leadership.is_leader());
        assert!(leadership.ensure_leader().is_ok());
        leadership.resign().await.unwrap();
        assert!(leadership.member_path().is_none());
    }

    #[tokio::test]
    async fn first_candidate_leads() {
        let ensemble = LocalEnsemble::new();
        let client: Arc<dyn CoordinationClient> = Arc::new(ensemble.connect(TIMEOUT));
        let service = SingletonService::new(client, GROUP);

        let (_stop, stop) = watch::channel(false);
        let leadership = service.campaign("host-a:8081", stop).await.unwrap().unwrap();
        assert!(leadership.is_leader());
        assert_eq!(service.candidates().await.unwrap(), vec!["host-a:8081"]);
    }

    #[tokio::test]
    async fn second_candidate_waits_for_resignation() {
        let ensemble = LocalEnsemble::new();
        let a = SingletonService::new(Arc::new(ensemble.connect(TIMEOUT)), GROUP);
        let b = SingletonService::new(Arc::new(ensemble.connect(TIMEOUT)), GROUP);

        let (_stop, stop) = watch::channel(false);
        let leader_a = a.campaign("a", stop.clone()).await.unwrap().unwrap();
        let pending = tokio::spawn(async move { b.campaign("b", stop).await });

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        leader_a.resign().await.unwrap();
        assert!(!leader_a.is_leader());

        let leader_b = pending.await.unwrap().unwrap().unwrap();
        assert!(leader_b.is_leader());
    }

    #[tokio::test]
    async fn session_expiry_revokes_and_hands_over() {
        let ensemble = LocalEnsemble::new();
        let client_a = Arc::new(ensemble.connect(TIMEOUT));
        let session_a = client_a.session_id();
        let a = SingletonService::new(client_a, GROUP);
        let b = SingletonService::new(Arc::new(ensemble.connect(TIMEOUT)), GROUP);

        let (_stop, stop) = watch::channel(false);
        let leader_a = a.campaign("a", stop.clone()).await.unwrap().unwrap();
        let pending = tokio::spawn(async move { b.campaign("b", stop).await });

        ensemble.expire_session(session_a);
        leader_a.lost().await;
        assert!(!leader_a.is_leader());
        assert_eq!(leader_a.ensure_leader(), Err(CoordError::NotLeader));

        let leader_b = pending.await.unwrap().unwrap().unwrap();
        assert!(leader_b.is_leader());
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_monitor() {
        let ensemble = LocalEnsemble::new();
        let service = SingletonService::new(Arc::new(ensemble.connect(TIMEOUT)), GROUP);
        let (_stop, stop) = watch::channel(false);
        let leadership = service.campaign("a", stop).await.unwrap().unwrap();
        let mut rx = leadership.subscribe();
        let copy = leadership.clone();

        drop(leadership);
        assert!(copy.is_leader());
        drop(copy);

        // Only the monitor could still hold the sender.
        let closed = tokio::time::timeout(TIMEOUT, rx.changed()).await.unwrap();
        assert!(closed.is_err());
    }

    #[tokio::test]
    async fn campaign_is_cancellable() {
        let ensemble = LocalEnsemble::new();
        let a = SingletonService::new(Arc::new(ensemble.connect(TIMEOUT)), GROUP);
        let b = SingletonService::new(Arc::new(ensemble.connect(TIMEOUT)), GROUP);
        let (_keep, keep) = watch::channel(false);
        let _leader_a = a.campaign("a", keep).await.unwrap().unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let pending = tokio::spawn(async move {
            let outcome = b.campaign("b", stop_rx).await;
            (outcome, b)
        });
        tokio::task::yield_now().await;
        stop_tx.send_replace(true);

        let (outcome, b) = pending.await.unwrap();
        assert!(outcome.unwrap().is_none());
        assert_eq!(b.candidates().await.unwrap(), vec!["a"]);
    }
}
