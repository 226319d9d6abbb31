//! redb-backed update store.
//!
//! Configurations are JSON-serialized into the `job_update_configs` table
//! under `{role}/{job}` keys, so per-role queries are a key-prefix scan.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use super::{MutableUpdateStore, UpdateStore};
use crate::error::{StateError, StateResult};
use crate::tables::UPDATE_CONFIGS;
use crate::types::{JobKey, JobUpdateConfiguration};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Durable update store backed by redb.
#[derive(Clone)]
pub struct RedbUpdateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbUpdateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbUpdateStore").finish_non_exhaustive()
    }
}

impl RedbUpdateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "update store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(UPDATE_CONFIGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get(&self, key: &str) -> StateResult<Option<JobUpdateConfiguration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(UPDATE_CONFIGS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let config =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Configurations whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> StateResult<Vec<JobUpdateConfiguration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(UPDATE_CONFIGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let config: JobUpdateConfiguration =
                    serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
                results.push(config);
            }
        }
        Ok(results)
    }

    fn put(&self, config: &JobUpdateConfiguration) -> StateResult<()> {
        config.job_key.validate()?;
        let key = config.job_key.table_key();
        let value = serde_json::to_vec(config).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(UPDATE_CONFIGS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, token = %config.update_token, "update config stored");
        Ok(())
    }

    fn remove(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(UPDATE_CONFIGS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "update config removed");
        Ok(existed)
    }

    /// Clear the table and insert `configs` in one transaction.
    fn replace(&self, configs: &[JobUpdateConfiguration]) -> StateResult<()> {
        let mut encoded = Vec::with_capacity(configs.len());
        for config in configs {
            config.job_key.validate()?;
            let value = serde_json::to_vec(config).map_err(map_err!(Encode))?;
            encoded.push((config.job_key.table_key(), value));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(UPDATE_CONFIGS).map_err(map_err!(Table))?;
            let existing: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .map(|entry| entry.map(|(key, _)| key.value().to_string()))
                .collect::<Result<_, _>>()
                .map_err(map_err!(Read))?;
            for key in &existing {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for (key, value) in &encoded {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = encoded.len(), "update configs replaced");
        Ok(())
    }
}

#[async_trait]
impl UpdateStore for RedbUpdateStore {
    async fn fetch_job_update_config(
        &self,
        job_key: &JobKey,
    ) -> StateResult<Option<JobUpdateConfiguration>> {
        self.get(&job_key.table_key())
    }

    async fn fetch_update_configs(
        &self,
        role: &str,
    ) -> StateResult<BTreeSet<JobUpdateConfiguration>> {
        Ok(self.scan(&format!("{role}/"))?.into_iter().collect())
    }

    async fn fetch_updating_roles(&self) -> StateResult<BTreeSet<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(UPDATE_CONFIGS).map_err(map_err!(Table))?;
        let mut roles = BTreeSet::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some((role, _)) = key.value().split_once('/') {
                roles.insert(role.to_string());
            }
        }
        Ok(roles)
    }

    async fn snapshot(&self) -> StateResult<Vec<JobUpdateConfiguration>> {
        // Keys sort as "{role}/{job}", which differs from JobKey order
        // when a role is a prefix of another.
        let mut all = self.scan("")?;
        all.sort_by(|a, b| a.job_key.cmp(&b.job_key));
        Ok(all)
    }
}

#[async_trait]
impl MutableUpdateStore for RedbUpdateStore {
    async fn save_job_update_config(&self, config: JobUpdateConfiguration) -> StateResult<()> {
        self.put(&config)
    }

    async fn remove_shard_update_configs(&self, job_key: &JobKey) -> StateResult<()> {
        self.remove(&job_key.table_key())?;
        Ok(())
    }

    async fn delete_shard_update_configs(&self) -> StateResult<()> {
        self.replace(&[])
    }

    async fn restore(&self, configs: Vec<JobUpdateConfiguration>) -> StateResult<()> {
        self.replace(&configs)
    }
}
