//! Command-line flags, the optional `keel.toml` file, and the merged
//! [`SchedulerOptions`].
//!
//! Precedence: flag, then file, then built-in default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use keel_coord::Version;
use keel_coord::client::validate_path;
use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, BootstrapResult};

pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_NAME_SPEC: &str = "/keel/scheduler";
pub const DEFAULT_LOCAL_PATH: &str = "/var/lib/keel/scheduler-state.json";
pub const DEFAULT_FRAMEWORK_NAME: &str = "keel";

#[derive(Debug, Default, Parser)]
#[command(name = "keeld", about = "Keel scheduler daemon")]
pub struct Cli {
    /// TOML configuration file. Flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Coordination service endpoints, comma-separated. Leave unset to run
    /// without leader election.
    #[arg(long, value_delimiter = ',')]
    pub zk_endpoints: Vec<String>,

    /// Session timeout in seconds.
    #[arg(long)]
    pub zk_session_timeout_secs: Option<u64>,

    /// Leader-election group path.
    #[arg(long)]
    pub scheduler_name_spec: Option<String>,

    /// Endpoint advertised to other candidates.
    #[arg(long)]
    pub advertise: Option<String>,

    /// Store scheduler state at this coordination-service path.
    #[arg(long)]
    pub persistence_zk_path: Option<String>,

    /// Version the state node must be at when this scheduler first reads it.
    #[arg(long, allow_negative_numbers = true)]
    pub persistence_zk_version: Option<Version>,

    /// Local state file, used when no coordination path is set.
    #[arg(long)]
    pub persistence_local_path: Option<PathBuf>,

    /// Keep the update-configuration index in a redb file at this path
    /// instead of in memory. Rebuilt from persisted state on every
    /// leadership term.
    #[arg(long)]
    pub update_store_path: Option<PathBuf>,

    /// Resource-manager address.
    #[arg(long)]
    pub master: Option<String>,

    /// Name to register with the resource manager.
    #[arg(long)]
    pub framework_name: Option<String>,
}

impl Cli {
    /// Load the config file (if any), merge, and validate.
    pub fn into_options(self) -> BootstrapResult<SchedulerOptions> {
        let file = match &self.config {
            Some(path) => KeelConfig::from_file(path)?,
            None => KeelConfig::default(),
        };
        let options = SchedulerOptions::merge(self, file);
        options.validate()?;
        Ok(options)
    }
}

// ── File ──────────────────────────────────────────────────────────

/// Contents of `keel.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeelConfig {
    pub coordination: CoordinationSection,
    pub scheduler: SchedulerSection,
    pub persistence: PersistenceSection,
    pub master: MasterSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationSection {
    pub endpoints: Vec<String>,
    pub session_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub name_spec: Option<String>,
    pub advertise: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceSection {
    pub zk_path: Option<String>,
    pub zk_version: Option<Version>,
    pub local_path: Option<PathBuf>,
    pub update_store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterSection {
    pub address: Option<String>,
    pub framework_name: Option<String>,
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> BootstrapResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BootstrapError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| BootstrapError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> BootstrapResult<Self> {
        toml::from_str(content).map_err(|e| BootstrapError::Config(e.to_string()))
    }
}

// ── Resolved options ──────────────────────────────────────────────

/// Fully resolved daemon settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub zk_endpoints: Vec<String>,
    pub zk_session_timeout: Duration,
    pub scheduler_name_spec: String,
    pub advertise: String,
    pub persistence_zk_path: Option<String>,
    pub persistence_zk_version: Option<Version>,
    pub persistence_local_path: PathBuf,
    pub update_store_path: Option<PathBuf>,
    pub master: String,
    pub framework_name: String,
}

impl SchedulerOptions {
    /// Defaults for everything except the master address.
    pub fn new(master: impl Into<String>) -> Self {
        Self {
            zk_endpoints: Vec::new(),
            zk_session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            scheduler_name_spec: DEFAULT_NAME_SPEC.to_string(),
            advertise: default_advertise(),
            persistence_zk_path: None,
            persistence_zk_version: None,
            persistence_local_path: PathBuf::from(DEFAULT_LOCAL_PATH),
            update_store_path: None,
            master: master.into(),
            framework_name: DEFAULT_FRAMEWORK_NAME.to_string(),
        }
    }

    pub fn merge(cli: Cli, file: KeelConfig) -> Self {
        let defaults = Self::new(String::new());
        Self {
            zk_endpoints: if cli.zk_endpoints.is_empty() {
                file.coordination.endpoints
            } else {
                cli.zk_endpoints
            },
            zk_session_timeout: cli
                .zk_session_timeout_secs
                .or(file.coordination.session_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.zk_session_timeout),
            scheduler_name_spec: cli
                .scheduler_name_spec
                .or(file.scheduler.name_spec)
                .unwrap_or(defaults.scheduler_name_spec),
            advertise: cli
                .advertise
                .or(file.scheduler.advertise)
                .unwrap_or(defaults.advertise),
            persistence_zk_path: cli.persistence_zk_path.or(file.persistence.zk_path),
            persistence_zk_version: cli
                .persistence_zk_version
                .or(file.persistence.zk_version),
            persistence_local_path: cli
                .persistence_local_path
                .or(file.persistence.local_path)
                .unwrap_or(defaults.persistence_local_path),
            update_store_path: cli
                .update_store_path
                .or(file.persistence.update_store_path),
            master: cli.master.or(file.master.address).unwrap_or_default(),
            framework_name: cli
                .framework_name
                .or(file.master.framework_name)
                .unwrap_or(defaults.framework_name),
        }
    }

    pub fn validate(&self) -> BootstrapResult<()> {
        if self.master.trim().is_empty() {
            return Err(BootstrapError::Config(
                "master address is required (--master or master.address)".to_string(),
            ));
        }
        if self.framework_name.is_empty() {
            return Err(BootstrapError::Config(
                "framework name must not be empty".to_string(),
            ));
        }
        if self.zk_session_timeout.is_zero() {
            return Err(BootstrapError::Config(
                "session timeout must be positive".to_string(),
            ));
        }
        if let Some(path) = &self.persistence_zk_path {
            if self.zk_endpoints.is_empty() {
                return Err(BootstrapError::Config(format!(
                    "persistence path {path} requires coordination endpoints"
                )));
            }
            validate_path(path).map_err(|e| BootstrapError::Config(e.to_string()))?;
        }
        if self.persistence_zk_version.is_some() && self.persistence_zk_path.is_none() {
            return Err(BootstrapError::Config(
                "persistence version given without a persistence path".to_string(),
            ));
        }
        if !self.zk_endpoints.is_empty() {
            validate_path(&self.scheduler_name_spec)
                .map_err(|e| BootstrapError::Config(e.to_string()))?;
        }
        if let Some(path) = &self.persistence_zk_path {
            let group = &self.scheduler_name_spec;
            if is_within(group, path) || is_within(path, group) {
                return Err(BootstrapError::Config(format!(
                    "persistence path {path} overlaps the leader-election group {group}"
                )));
            }
        }
        Ok(())
    }

    pub fn coordinated(&self) -> bool {
        !self.zk_endpoints.is_empty()
    }
}

/// Whether `path` is `ancestor` or lies beneath it.
fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor || path.starts_with(&format!("{}/", ancestor.trim_end_matches('/')))
}

fn default_advertise() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("keeld").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_apply() {
        let options = parse(&["--master", "master:5050"]).into_options().unwrap();
        assert_eq!(options.master, "master:5050");
        assert!(options.zk_endpoints.is_empty());
        assert_eq!(options.zk_session_timeout, Duration::from_secs(15));
        assert_eq!(options.scheduler_name_spec, "/keel/scheduler");
        assert_eq!(
            options.persistence_local_path,
            PathBuf::from("/var/lib/keel/scheduler-state.json")
        );
        assert_eq!(options.framework_name, "keel");
        assert!(!options.coordinated());
    }

    #[test]
    fn endpoints_split_on_commas() {
        let cli = parse(&["--master", "m", "--zk-endpoints", "a:2181,b:2181"]);
        assert_eq!(cli.zk_endpoints, vec!["a:2181", "b:2181"]);
    }

    #[test]
    fn file_fills_gaps_and_flags_win() {
        let file = KeelConfig::parse(
            r#"
            [coordination]
            endpoints = ["memory://file"]
            session_timeout_secs = 30

            [persistence]
            zk_path = "/keel/state"

            [master]
            address = "file-master:5050"
            framework_name = "from-file"
            "#,
        )
        .unwrap();

        let cli = parse(&["--master", "flag-master:5050"]);
        let options = SchedulerOptions::merge(cli, file);
        assert_eq!(options.master, "flag-master:5050");
        assert_eq!(options.framework_name, "from-file");
        assert_eq!(options.zk_endpoints, vec!["memory://file"]);
        assert_eq!(options.zk_session_timeout, Duration::from_secs(30));
        assert_eq!(options.persistence_zk_path.as_deref(), Some("/keel/state"));
        options.validate().unwrap();
    }

    #[test]
    fn config_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        std::fs::write(&path, "[master]\naddress = \"disk:5050\"\n").unwrap();

        let cli = parse(&["--config", path.to_str().unwrap()]);
        let options = cli.into_options().unwrap();
        assert_eq!(options.master, "disk:5050");
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = KeelConfig::parse("[master]\nadress = \"typo\"\n").unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
    }

    #[test]
    fn missing_master_rejected() {
        let err = parse(&[]).into_options().unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
    }

    #[test]
    fn coordinated_persistence_requires_endpoints() {
        let mut options = SchedulerOptions::new("m");
        options.persistence_zk_path = Some("/keel/state".to_string());
        assert!(matches!(options.validate(), Err(BootstrapError::Config(_))));

        options.zk_endpoints = vec!["memory://x".to_string()];
        options.validate().unwrap();

        options.persistence_zk_path = Some("relative".to_string());
        assert!(matches!(options.validate(), Err(BootstrapError::Config(_))));
    }

    #[test]
    fn version_without_path_rejected() {
        let mut options = SchedulerOptions::new("m");
        options.persistence_zk_version = Some(3);
        assert!(matches!(options.validate(), Err(BootstrapError::Config(_))));
    }

    #[test]
    fn overlapping_state_and_election_paths_rejected() {
        let mut options = SchedulerOptions::new("m");
        options.zk_endpoints = vec!["memory://x".to_string()];
        for path in ["/keel/scheduler", "/keel", "/keel/scheduler/state"] {
            options.persistence_zk_path = Some(path.to_string());
            assert!(
                matches!(options.validate(), Err(BootstrapError::Config(_))),
                "{path} should be rejected"
            );
        }

        // Siblings and shared name prefixes are fine.
        for path in ["/keel/state", "/keel/scheduler-state"] {
            options.persistence_zk_path = Some(path.to_string());
            options.validate().unwrap();
        }
    }

    #[test]
    fn update_store_path_from_file_or_flag() {
        let file = KeelConfig::parse(
            r#"
            [persistence]
            update_store_path = "/var/lib/keel/updates.redb"
            "#,
        )
        .unwrap();
        let options = SchedulerOptions::merge(parse(&["--master", "m"]), file.clone());
        assert_eq!(
            options.update_store_path,
            Some(PathBuf::from("/var/lib/keel/updates.redb"))
        );

        let cli = parse(&["--master", "m", "--update-store-path", "/tmp/u.redb"]);
        let options = SchedulerOptions::merge(cli, file);
        assert_eq!(options.update_store_path, Some(PathBuf::from("/tmp/u.redb")));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut options = SchedulerOptions::new("m");
        options.zk_session_timeout = Duration::ZERO;
        assert!(matches!(options.validate(), Err(BootstrapError::Config(_))));
    }
}
