//! Leader-gated, write-through scheduler storage.
//!
//! [`SchedulerStorage`] keeps a working view of [`SchedulerState`] and
//! commits every mutation to the configured persistence layer before
//! applying it. The framework identity is held in memory; update
//! configurations live in an index, a [`MemUpdateStore`] by default or any
//! other [`MutableUpdateStore`] such as a local redb file. The index is
//! rebuilt from the persisted snapshot on every recovery. Mutations are
//! serialized; reads never block on a commit in flight.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use keel_coord::Leadership;
use keel_state::{
    FrameworkId, JobKey, JobUpdateConfiguration, MemUpdateStore, MutableUpdateStore,
    PersistenceLayer, SchedulerState, StateError, StateResult, UpdateStore,
};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

/// Working copy a mutation is computed on.
struct Draft {
    framework_id: Option<FrameworkId>,
    configs: BTreeMap<JobKey, JobUpdateConfiguration>,
}

impl Draft {
    fn into_state(self) -> SchedulerState {
        SchedulerState {
            framework_id: self.framework_id,
            update_configs: self.configs.into_values().collect(),
        }
    }
}

/// Last committed state as seen by readers. Both halves change under one
/// write guard.
struct View {
    framework_id: Option<FrameworkId>,
    index: Arc<dyn MutableUpdateStore>,
    diverged: bool,
}

pub struct SchedulerStorage {
    persistence: Arc<dyn PersistenceLayer<SchedulerState>>,
    leadership: Leadership,
    view: RwLock<View>,
    commit: Mutex<()>,
}

impl fmt::Debug for SchedulerStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SchedulerStorage");
        if let Ok(view) = self.view.try_read() {
            d.field("framework_id", &view.framework_id)
                .field("diverged", &view.diverged);
        }
        d.finish_non_exhaustive()
    }
}

impl SchedulerStorage {
    /// Load the persisted snapshot and build storage on top of it, with
    /// update configurations indexed in memory.
    ///
    /// An empty backend yields empty state. Undecodable contents fail with
    /// [`StateError::Decode`]; nothing is written in that case.
    pub async fn recover(
        persistence: Arc<dyn PersistenceLayer<SchedulerState>>,
        leadership: Leadership,
    ) -> StateResult<Self> {
        Self::recover_with_index(persistence, Arc::new(MemUpdateStore::new()), leadership).await
    }

    /// Like [`recover`](Self::recover), indexing update configurations in
    /// `index`. Whatever `index` held before is replaced by the persisted
    /// snapshot.
    pub async fn recover_with_index(
        persistence: Arc<dyn PersistenceLayer<SchedulerState>>,
        index: Arc<dyn MutableUpdateStore>,
        leadership: Leadership,
    ) -> StateResult<Self> {
        let state = persistence.get().await?;
        let found = state.is_some();
        let state = state.unwrap_or_default();
        for cfg in &state.update_configs {
            cfg.job_key.validate()?;
        }

        let update_configs = state.update_configs.len();
        index.restore(state.update_configs).await?;
        info!(
            found,
            framework_id = ?state.framework_id,
            update_configs,
            "scheduler state recovered"
        );
        Ok(Self {
            persistence,
            leadership,
            view: RwLock::new(View {
                framework_id: state.framework_id,
                index,
                diverged: false,
            }),
            commit: Mutex::new(()),
        })
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    pub async fn framework_id(&self) -> StateResult<Option<FrameworkId>> {
        Ok(self.read_view().await?.framework_id.clone())
    }

    /// The state as last committed, read under a single guard.
    pub async fn state(&self) -> StateResult<SchedulerState> {
        let view = self.read_view().await?;
        Ok(SchedulerState {
            framework_id: view.framework_id.clone(),
            update_configs: view.index.snapshot().await?,
        })
    }

    pub async fn save_framework_id(&self, id: FrameworkId) -> StateResult<()> {
        debug!(framework_id = %id, "saving framework id");
        self.mutate(move |draft| draft.framework_id = Some(id)).await
    }

    async fn read_view(&self) -> StateResult<RwLockReadGuard<'_, View>> {
        let view = self.view.read().await;
        if view.diverged {
            return Err(StateError::Diverged(
                "an earlier commit could not be applied locally".to_string(),
            ));
        }
        Ok(view)
    }

    /// Compute, commit, then apply one change.
    ///
    /// Leadership is checked before and after waiting for the commit lock.
    /// A failed commit leaves the view untouched. If the view cannot take
    /// a committed change, storage refuses all further use.
    async fn mutate<F>(&self, change: F) -> StateResult<()>
    where
        F: FnOnce(&mut Draft) + Send,
    {
        self.leadership.ensure_leader()?;
        let _commit = self.commit.lock().await;
        self.leadership.ensure_leader()?;

        let current = self.state().await?;
        let mut draft = Draft {
            framework_id: current.framework_id,
            configs: current
                .update_configs
                .into_iter()
                .map(|cfg| (cfg.job_key.clone(), cfg))
                .collect(),
        };
        change(&mut draft);
        let next = draft.into_state();

        if let Err(e) = self.persistence.set(&next).await {
            warn!(error = %e, "failed to commit scheduler state");
            return Err(e);
        }

        let mut view = self.view.write().await;
        view.framework_id = next.framework_id;
        if let Err(e) = view.index.restore(next.update_configs).await {
            error!(error = %e, "committed state could not be applied to the update index");
            view.diverged = true;
            return Err(StateError::Diverged(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateStore for SchedulerStorage {
    async fn fetch_job_update_config(
        &self,
        job_key: &JobKey,
    ) -> StateResult<Option<JobUpdateConfiguration>> {
        self.read_view()
            .await?
            .index
            .fetch_job_update_config(job_key)
            .await
    }

    async fn fetch_update_configs(
        &self,
        role: &str,
    ) -> StateResult<BTreeSet<JobUpdateConfiguration>> {
        self.read_view().await?.index.fetch_update_configs(role).await
    }

    async fn fetch_updating_roles(&self) -> StateResult<BTreeSet<String>> {
        self.read_view().await?.index.fetch_updating_roles().await
    }

    async fn snapshot(&self) -> StateResult<Vec<JobUpdateConfiguration>> {
        self.read_view().await?.index.snapshot().await
    }
}

#[async_trait]
impl MutableUpdateStore for SchedulerStorage {
    async fn save_job_update_config(&self, config: JobUpdateConfiguration) -> StateResult<()> {
        config.job_key.validate()?;
        let key = config.job_key.clone();
        self.mutate(move |draft| {
            draft.configs.insert(config.job_key.clone(), config);
        })
        .await?;
        info!(job = %key, "update config saved");
        Ok(())
    }

    async fn remove_shard_update_configs(&self, job_key: &JobKey) -> StateResult<()> {
        if self.fetch_job_update_config(job_key).await?.is_none() {
            // Nothing to remove, but a non-leader must still be refused.
            return self.leadership.ensure_leader().map_err(StateError::from);
        }
        let key = job_key.clone();
        self.mutate(move |draft| {
            draft.configs.remove(&key);
        })
        .await?;
        info!(job = %job_key, "update config removed");
        Ok(())
    }

    async fn delete_shard_update_configs(&self) -> StateResult<()> {
        self.mutate(|draft| draft.configs.clear()).await?;
        info!("all update configs deleted");
        Ok(())
    }

    async fn restore(&self, configs: Vec<JobUpdateConfiguration>) -> StateResult<()> {
        for cfg in &configs {
            cfg.job_key.validate()?;
        }
        let count = configs.len();
        self.mutate(move |draft| {
            draft.configs = configs
                .into_iter()
                .map(|cfg| (cfg.job_key.clone(), cfg))
                .collect();
        })
        .await?;
        info!(count, "update configs restored");
        Ok(())
    }
}
