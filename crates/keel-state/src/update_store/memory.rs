use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{MutableUpdateStore, UpdateStore};
use crate::error::StateResult;
use crate::types::{JobKey, JobUpdateConfiguration};

/// In-memory update store.
#[derive(Debug, Default)]
pub struct MemUpdateStore {
    configs: RwLock<BTreeMap<JobKey, JobUpdateConfiguration>>,
}

impl MemUpdateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<JobKey, JobUpdateConfiguration>> {
        self.configs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<JobKey, JobUpdateConfiguration>> {
        self.configs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UpdateStore for MemUpdateStore {
    async fn fetch_job_update_config(
        &self,
        job_key: &JobKey,
    ) -> StateResult<Option<JobUpdateConfiguration>> {
        Ok(self.read().get(job_key).cloned())
    }

    async fn fetch_update_configs(
        &self,
        role: &str,
    ) -> StateResult<BTreeSet<JobUpdateConfiguration>> {
        Ok(self
            .read()
            .values()
            .filter(|cfg| cfg.role() == role)
            .cloned()
            .collect())
    }

    async fn fetch_updating_roles(&self) -> StateResult<BTreeSet<String>> {
        Ok(self.read().keys().map(|key| key.role.clone()).collect())
    }

    async fn snapshot(&self) -> StateResult<Vec<JobUpdateConfiguration>> {
        Ok(self.read().values().cloned().collect())
    }
}

#[async_trait]
impl MutableUpdateStore for MemUpdateStore {
    async fn save_job_update_config(&self, config: JobUpdateConfiguration) -> StateResult<()> {
        config.job_key.validate()?;
        self.write().insert(config.job_key.clone(), config);
        Ok(())
    }

    async fn remove_shard_update_configs(&self, job_key: &JobKey) -> StateResult<()> {
        self.write().remove(job_key);
        Ok(())
    }

    async fn delete_shard_update_configs(&self) -> StateResult<()> {
        self.write().clear();
        Ok(())
    }

    /// Later duplicates of a job key win.
    async fn restore(&self, configs: Vec<JobUpdateConfiguration>) -> StateResult<()> {
        for cfg in &configs {
            cfg.job_key.validate()?;
        }
        let fresh = configs
            .into_iter()
            .map(|cfg| (cfg.job_key.clone(), cfg))
            .collect();
        *self.write() = fresh;
        Ok(())
    }
}
