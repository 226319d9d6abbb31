//! Framework (re)registration on becoming leader.

use std::sync::Arc;

use keel_state::FrameworkId;
use tracing::{info, warn};

use crate::driver::{RegistrationRequest, ResourceManager};
use crate::error::SchedulerResult;
use crate::storage::SchedulerStorage;

/// Outcome of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub framework_id: FrameworkId,
    /// Whether the master accepted the persisted identity.
    pub resumed: bool,
    pub master: String,
}

/// Registers the scheduler with the master under its durable identity.
#[derive(Debug)]
pub struct FrameworkReconnector {
    storage: Arc<SchedulerStorage>,
    manager: Arc<dyn ResourceManager>,
    master: String,
    framework_name: String,
}

impl FrameworkReconnector {
    pub fn new(
        storage: Arc<SchedulerStorage>,
        manager: Arc<dyn ResourceManager>,
        master: impl Into<String>,
        framework_name: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            manager,
            master: master.into(),
            framework_name: framework_name.into(),
        }
    }

    /// Resume the persisted identity if there is one, otherwise register
    /// fresh. Any identity the master assigns is persisted before this
    /// returns.
    pub async fn connect(&self) -> SchedulerResult<Connection> {
        self.storage.leadership().ensure_leader()?;

        let persisted = self.storage.framework_id().await?;
        let request = match &persisted {
            Some(id) => {
                info!(framework_id = %id, master = %self.master, "found persisted framework id, resuming");
                RegistrationRequest::Resume(id.clone())
            }
            None => {
                info!(master = %self.master, "no persisted framework id, registering as new");
                RegistrationRequest::New
            }
        };

        let assigned = self
            .manager
            .register(&self.master, &self.framework_name, request)
            .await?;

        let resumed = persisted.as_ref() == Some(&assigned);
        if !resumed {
            if let Some(old) = &persisted {
                warn!(old = %old, new = %assigned, "master assigned a different framework id");
            }
            self.storage.save_framework_id(assigned.clone()).await?;
        }

        info!(framework_id = %assigned, resumed, "framework registered");
        Ok(Connection {
            framework_id: assigned,
            resumed,
            master: self.master.clone(),
        })
    }
}
