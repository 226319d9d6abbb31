//! Domain types for Keel scheduler state.
//!
//! These types make up the persisted `SchedulerState` snapshot and the
//! rolling-update records held by the update store. All are serializable
//! to/from JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

// ── Framework ─────────────────────────────────────────────────────

/// Identity assigned to this scheduler by the resource manager on first
/// registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameworkId(String);

impl FrameworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

/// A job, scoped by its owning role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub role: String,
    pub name: String,
}

impl JobKey {
    pub fn new(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
        }
    }

    /// Reject keys that cannot be stored unambiguously.
    pub fn validate(&self) -> StateResult<()> {
        for (field, value) in [("role", &self.role), ("name", &self.name)] {
            if value.is_empty() || value.contains('/') {
                return Err(StateError::InvalidJobKey(format!(
                    "{field} {value:?} must be non-empty and contain no '/'"
                )));
            }
        }
        Ok(())
    }

    /// Build the composite key for the update-config table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.role, self.name)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.name)
    }
}

/// Configuration of one task (shard) of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskConfig {
    pub owner: String,
    pub job_name: String,
    pub shard_id: u32,
    /// CPU in thousandths of a core.
    pub cpu_millis: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub priority: i32,
    pub max_task_failures: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// ── Rolling updates ───────────────────────────────────────────────

/// Old and new configuration of a single shard.
///
/// `old == None` adds the shard; `new == None` removes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardUpdate {
    pub old: Option<TaskConfig>,
    pub new: Option<TaskConfig>,
}

/// An in-progress rolling update of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobUpdateConfiguration {
    pub job_key: JobKey,
    /// Identifies this update attempt; commands carrying another token
    /// refer to a superseded update.
    pub update_token: String,
    /// Per-shard configurations keyed by shard id.
    pub shards: BTreeMap<u32, ShardUpdate>,
}

impl JobUpdateConfiguration {
    pub fn new(job_key: JobKey, update_token: impl Into<String>) -> Self {
        Self {
            job_key,
            update_token: update_token.into(),
            shards: BTreeMap::new(),
        }
    }

    /// Add (or replace) one shard's old/new configuration.
    pub fn with_shard(
        mut self,
        shard_id: u32,
        old: Option<TaskConfig>,
        new: Option<TaskConfig>,
    ) -> Self {
        self.shards.insert(shard_id, ShardUpdate { old, new });
        self
    }

    pub fn role(&self) -> &str {
        &self.job_key.role
    }

    /// Shards whose configuration actually changes.
    pub fn changed_shards(&self) -> impl Iterator<Item = u32> + '_ {
        self.shards
            .iter()
            .filter(|(_, update)| update.old != update.new)
            .map(|(id, _)| *id)
    }
}

// ── Snapshot ──────────────────────────────────────────────────────

/// The root persisted snapshot of a scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    #[serde(default)]
    pub framework_id: Option<FrameworkId>,
    /// Active update configurations, ordered by job key.
    #[serde(default)]
    pub update_configs: Vec<JobUpdateConfiguration>,
}
