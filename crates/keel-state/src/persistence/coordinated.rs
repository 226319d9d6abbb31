use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use keel_coord::{CoordError, CoordinationClient, CreateMode, Version, client::validate_path};
use tracing::{debug, warn};

use super::PersistenceLayer;
use crate::error::{StateError, StateResult};

/// Stores the slot as the data of one coordination-service node.
///
/// Writes are conditional: each `set` expects the node to still be at the
/// version this instance last read or wrote. Before anything has been
/// observed the configured initial version is expected; with none
/// configured, the first `set` only succeeds by creating the node. A
/// mismatch fails with [`StateError::Conflict`] and leaves the node
/// untouched, so a stale writer cannot overwrite a newer snapshot.
///
/// A configured initial version also holds for reads: until it has been
/// confirmed, a `get` that finds the node at any other version fails with
/// [`StateError::Conflict`] instead of adopting what it read.
#[derive(Debug)]
pub struct CoordinatedPersistence {
    client: Arc<dyn CoordinationClient>,
    path: String,
    versions: Mutex<Versions>,
}

#[derive(Debug, Default)]
struct Versions {
    known: Option<Version>,
    /// Configured initial version not yet matched against the node.
    unconfirmed: Option<Version>,
}

impl CoordinatedPersistence {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        path: impl Into<String>,
        initial_version: Option<Version>,
    ) -> StateResult<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self {
            client,
            path,
            versions: Mutex::new(Versions {
                known: initial_version,
                unconfirmed: initial_version,
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Version the next `set` will expect.
    pub fn expected_version(&self) -> Option<Version> {
        self.lock_versions().known
    }

    fn lock_versions(&self) -> std::sync::MutexGuard<'_, Versions> {
        self.versions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn create(&self, value: &[u8]) -> StateResult<Version> {
        self.client.create_parents(&self.path).await?;
        match self
            .client
            .create(&self.path, value, CreateMode::Persistent)
            .await
        {
            Ok(_) => Ok(0),
            Err(CoordError::NodeExists(_)) => {
                let actual = self
                    .client
                    .get_data(&self.path)
                    .await?
                    .map(|(_, stat)| stat.version);
                Err(self.conflict(None, actual))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, value: &[u8], expected: Version) -> StateResult<Version> {
        match self.client.set_data(&self.path, value, Some(expected)).await {
            Ok(stat) => Ok(stat.version),
            Err(CoordError::BadVersion { actual, .. }) => {
                Err(self.conflict(Some(expected), Some(actual)))
            }
            Err(CoordError::NoNode(_)) => Err(self.conflict(Some(expected), None)),
            Err(e) => Err(e.into()),
        }
    }

    fn conflict(&self, expected: Option<Version>, actual: Option<Version>) -> StateError {
        warn!(path = %self.path, ?expected, ?actual, "conditional write rejected");
        StateError::Conflict {
            path: self.path.clone(),
            expected,
            actual,
        }
    }
}

#[async_trait]
impl PersistenceLayer<Vec<u8>> for CoordinatedPersistence {
    async fn get(&self) -> StateResult<Option<Vec<u8>>> {
        let node = self.client.get_data(&self.path).await?;
        let observed = node.as_ref().map(|(_, stat)| stat.version);
        {
            let mut versions = self.lock_versions();
            if let Some(configured) = versions.unconfirmed {
                if observed != Some(configured) {
                    drop(versions);
                    return Err(self.conflict(Some(configured), observed));
                }
                versions.unconfirmed = None;
            }
            versions.known = observed;
        }
        Ok(node.map(|(data, _)| data))
    }

    async fn set(&self, value: &Vec<u8>) -> StateResult<()> {
        let expected = self.expected_version();
        let version = match expected {
            Some(v) => self.update(value, v).await?,
            None => self.create(value).await?,
        };
        {
            let mut versions = self.lock_versions();
            versions.known = Some(version);
            versions.unconfirmed = None;
        }
        debug!(path = %self.path, version, bytes = value.len(), "state node written");
        Ok(())
    }
}
