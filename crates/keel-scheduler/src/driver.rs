//! Boundary to the cluster resource manager ("master").

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use keel_state::FrameworkId;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// How a framework asks to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRequest {
    /// First registration; the master assigns an identity.
    New,
    /// Re-registration under a previously assigned identity.
    Resume(FrameworkId),
}

impl fmt::Display for RegistrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationRequest::New => f.write_str("new"),
            RegistrationRequest::Resume(id) => write!(f, "resume({id})"),
        }
    }
}

/// A resource manager frameworks register with.
#[async_trait]
pub trait ResourceManager: Send + Sync + fmt::Debug {
    /// Register `framework_name` at `master`, returning the identity the
    /// master settled on. A resume may still come back with a different
    /// identity if the master no longer knows the old one.
    async fn register(
        &self,
        master: &str,
        framework_name: &str,
        request: RegistrationRequest,
    ) -> SchedulerResult<FrameworkId>;
}

#[derive(Debug, Default)]
struct MasterState {
    next_seq: u64,
    known: HashSet<FrameworkId>,
    registrations: Vec<RegistrationRequest>,
}

/// In-process master used for single-host runs and tests.
///
/// Assigns identities `{framework_name}-{seq:04}`. A master built with
/// [`new`](Self::new) keeps no registry across restarts and accepts every
/// resume as-is. One built with [`with_registry`](Self::with_registry) only
/// honours identities it issued or was told about via
/// [`remember`](Self::remember), and answers any other resume with a fresh
/// identity.
#[derive(Debug)]
pub struct InProcessMaster {
    address: String,
    state: Mutex<MasterState>,
    reachable: AtomicBool,
    check_registry: bool,
}

impl InProcessMaster {
    pub fn new(address: impl Into<String>) -> Self {
        Self::build(address.into(), false)
    }

    /// A master that rejects resumes for identities it does not know.
    pub fn with_registry(address: impl Into<String>) -> Self {
        Self::build(address.into(), true)
    }

    fn build(address: String, check_registry: bool) -> Self {
        Self {
            address,
            state: Mutex::new(MasterState {
                next_seq: 1,
                ..MasterState::default()
            }),
            reachable: AtomicBool::new(true),
            check_registry,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Treat `id` as previously issued.
    pub fn remember(&self, id: FrameworkId) {
        self.lock().known.insert(id);
    }

    /// Forget every issued identity, as a master losing its registry would.
    pub fn forget_all(&self) {
        self.lock().known.clear();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Every registration request received so far, oldest first.
    pub fn registrations(&self) -> Vec<RegistrationRequest> {
        self.lock().registrations.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ResourceManager for InProcessMaster {
    async fn register(
        &self,
        master: &str,
        framework_name: &str,
        request: RegistrationRequest,
    ) -> SchedulerResult<FrameworkId> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SchedulerError::Registration(format!(
                "master {master} unreachable"
            )));
        }
        if master != self.address {
            return Err(SchedulerError::Registration(format!(
                "unknown master {master}, expected {}",
                self.address
            )));
        }

        let mut state = self.lock();
        state.registrations.push(request.clone());
        if let RegistrationRequest::Resume(id) = &request {
            if !self.check_registry || state.known.contains(id) {
                debug!(framework_id = %id, "framework re-registered");
                let id = id.clone();
                state.known.insert(id.clone());
                return Ok(id);
            }
            warn!(framework_id = %id, "unknown framework id, assigning a new one");
        }

        let id = FrameworkId::new(format!("{framework_name}-{:04}", state.next_seq));
        state.next_seq += 1;
        state.known.insert(id.clone());
        info!(framework_id = %id, %framework_name, "framework registered");
        Ok(id)
    }
}
