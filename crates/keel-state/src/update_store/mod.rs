//! Rolling-update configuration storage.
//!
//! [`UpdateStore`] is the read side; [`MutableUpdateStore`] adds writes.
//! Every implementation keeps at most one configuration per job key and
//! maintains "a role is updating iff some stored configuration has that
//! role".

mod durable;
mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::StateResult;
use crate::types::{JobKey, JobUpdateConfiguration};

pub use durable::RedbUpdateStore;
pub use memory::MemUpdateStore;

#[async_trait]
pub trait UpdateStore: Send + Sync {
    /// The configuration for `job_key`, if an update is in progress.
    async fn fetch_job_update_config(
        &self,
        job_key: &JobKey,
    ) -> StateResult<Option<JobUpdateConfiguration>>;

    /// All configurations whose job belongs to `role`.
    async fn fetch_update_configs(
        &self,
        role: &str,
    ) -> StateResult<BTreeSet<JobUpdateConfiguration>>;

    /// Roles with at least one configuration stored.
    async fn fetch_updating_roles(&self) -> StateResult<BTreeSet<String>>;

    /// Every stored configuration, ordered by job key.
    async fn snapshot(&self) -> StateResult<Vec<JobUpdateConfiguration>>;
}

#[async_trait]
pub trait MutableUpdateStore: UpdateStore {
    /// Insert or replace the configuration for its job key.
    async fn save_job_update_config(&self, config: JobUpdateConfiguration) -> StateResult<()>;

    /// Remove the configuration for `job_key`; a no-op when absent.
    async fn remove_shard_update_configs(&self, job_key: &JobKey) -> StateResult<()>;

    /// Remove every configuration.
    async fn delete_shard_update_configs(&self) -> StateResult<()>;

    /// Replace the whole contents with `configs`.
    async fn restore(&self, configs: Vec<JobUpdateConfiguration>) -> StateResult<()>;

    #[deprecated(note = "use `remove_shard_update_configs` with a `JobKey`")]
    async fn remove_shard_update_configs_for(&self, role: &str, job: &str) -> StateResult<()> {
        self.remove_shard_update_configs(&JobKey::new(role, job))
            .await
    }
}

/// Behavioural checks shared by every implementation's tests.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::types::TaskConfig;
    use std::collections::BTreeMap;

    pub fn config(role: &str, job: &str, token: &str) -> JobUpdateConfiguration {
        let task = TaskConfig {
            owner: role.to_string(),
            job_name: job.to_string(),
            shard_id: 0,
            cpu_millis: 250,
            ram_mb: 128,
            disk_mb: 256,
            priority: 0,
            max_task_failures: 1,
            metadata: BTreeMap::new(),
        };
        let mut upgraded = task.clone();
        upgraded.ram_mb = 256;
        JobUpdateConfiguration::new(JobKey::new(role, job), token).with_shard(
            0,
            Some(task),
            Some(upgraded),
        )
    }

    pub async fn save_replaces_by_job_key(store: &dyn MutableUpdateStore) {
        let key = JobKey::new("www-data", "frontend");
        store
            .save_job_update_config(config("www-data", "frontend", "t1"))
            .await
            .unwrap();
        store
            .save_job_update_config(config("www-data", "frontend", "t2"))
            .await
            .unwrap();

        let stored = store.fetch_job_update_config(&key).await.unwrap().unwrap();
        assert_eq!(stored.update_token, "t2");
        assert_eq!(store.fetch_update_configs("www-data").await.unwrap().len(), 1);
    }

    pub async fn roles_track_contents(store: &dyn MutableUpdateStore) {
        assert!(store.fetch_updating_roles().await.unwrap().is_empty());

        store
            .save_job_update_config(config("www-data", "frontend", "t1"))
            .await
            .unwrap();
        store
            .save_job_update_config(config("www-data", "backend", "t1"))
            .await
            .unwrap();
        store
            .save_job_update_config(config("batch", "nightly", "t1"))
            .await
            .unwrap();

        let roles: Vec<_> = store.fetch_updating_roles().await.unwrap().into_iter().collect();
        assert_eq!(roles, vec!["batch", "www-data"]);
        assert_eq!(store.fetch_update_configs("www-data").await.unwrap().len(), 2);
        assert!(store.fetch_update_configs("nobody").await.unwrap().is_empty());

        store
            .remove_shard_update_configs(&JobKey::new("batch", "nightly"))
            .await
            .unwrap();
        let roles: Vec<_> = store.fetch_updating_roles().await.unwrap().into_iter().collect();
        assert_eq!(roles, vec!["www-data"]);

        store
            .remove_shard_update_configs(&JobKey::new("www-data", "frontend"))
            .await
            .unwrap();
        assert!(store.fetch_updating_roles().await.unwrap().contains("www-data"));
    }

    pub async fn role_prefixes_do_not_collide(store: &dyn MutableUpdateStore) {
        store
            .save_job_update_config(config("web", "a", "t"))
            .await
            .unwrap();
        store
            .save_job_update_config(config("web-admin", "b", "t"))
            .await
            .unwrap();
        let web = store.fetch_update_configs("web").await.unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web.iter().next().unwrap().job_key.name, "a");
    }

    pub async fn remove_is_idempotent(store: &dyn MutableUpdateStore) {
        let key = JobKey::new("www-data", "missing");
        store.remove_shard_update_configs(&key).await.unwrap();
        store.remove_shard_update_configs(&key).await.unwrap();
        assert!(store.fetch_job_update_config(&key).await.unwrap().is_none());
    }

    #[allow(deprecated)]
    pub async fn deprecated_remove_by_role_and_job(store: &dyn MutableUpdateStore) {
        store
            .save_job_update_config(config("www-data", "frontend", "t1"))
            .await
            .unwrap();
        store
            .remove_shard_update_configs_for("www-data", "frontend")
            .await
            .unwrap();
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    pub async fn delete_all_and_restore(store: &dyn MutableUpdateStore) {
        store
            .save_job_update_config(config("a", "x", "t"))
            .await
            .unwrap();
        store
            .save_job_update_config(config("b", "y", "t"))
            .await
            .unwrap();
        let saved = store.snapshot().await.unwrap();
        assert_eq!(saved.len(), 2);

        store.delete_shard_update_configs().await.unwrap();
        assert!(store.snapshot().await.unwrap().is_empty());
        assert!(store.fetch_updating_roles().await.unwrap().is_empty());
        for cfg in &saved {
            assert!(
                store
                    .fetch_job_update_config(&cfg.job_key)
                    .await
                    .unwrap()
                    .is_none()
            );
        }

        store.restore(saved.clone()).await.unwrap();
        assert_eq!(store.snapshot().await.unwrap(), saved);
        for cfg in &saved {
            let restored = store.fetch_job_update_config(&cfg.job_key).await.unwrap();
            assert_eq!(restored.as_ref(), Some(cfg));
        }
    }

    pub async fn invalid_keys_rejected(store: &dyn MutableUpdateStore) {
        let err = store
            .save_job_update_config(config("www/data", "frontend", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::StateError::InvalidJobKey(_)));
    }

    pub async fn run_all<S: MutableUpdateStore>(make: impl Fn() -> S) {
        save_replaces_by_job_key(&make()).await;
        roles_track_contents(&make()).await;
        role_prefixes_do_not_collide(&make()).await;
        remove_is_idempotent(&make()).await;
        deprecated_remove_by_role_and_job(&make()).await;
        delete_all_and_restore(&make()).await;
        invalid_keys_rejected(&make()).await;
    }
}
