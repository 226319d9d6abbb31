//! Dependency wiring.
//!
//! Each function builds one piece from [`SchedulerOptions`]; [`Scheduler`]
//! strings them together and drives the leader lifecycle.

use std::sync::Arc;

use keel_coord::{Coordination, Leadership, SingletonService};
use keel_scheduler::{
    Connection, FrameworkReconnector, InProcessMaster, ResourceManager, SchedulerStorage,
};
use keel_state::{
    BlobPersistence, CoordinatedPersistence, EncodingPersistenceLayer, FileSystemPersistence,
    JsonCodec, MutableUpdateStore, PersistenceLayer, RedbUpdateStore, SchedulerState,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::SchedulerOptions;
use crate::error::{BootstrapError, BootstrapResult};

/// Connect to the coordination service, or disable coordination when no
/// endpoints are configured.
pub async fn coordination(options: &SchedulerOptions) -> BootstrapResult<Coordination> {
    Ok(Coordination::connect(&options.zk_endpoints, options.zk_session_timeout).await?)
}

/// Leader election over the configured group, when coordination is on.
pub fn singleton_service(
    coordination: &Coordination,
    options: &SchedulerOptions,
) -> Option<SingletonService> {
    coordination.client().map(|client| {
        SingletonService::new(Arc::clone(client), options.scheduler_name_spec.clone())
    })
}

/// The typed scheduler-state slot.
///
/// A coordination path selects [`CoordinatedPersistence`] and needs a
/// coordination client; otherwise state lives in a local file.
pub fn persistence_layer(
    coordination: &Coordination,
    options: &SchedulerOptions,
) -> BootstrapResult<Arc<dyn PersistenceLayer<SchedulerState>>> {
    let backend: Arc<BlobPersistence> = match (&options.persistence_zk_path, coordination.client())
    {
        (Some(path), Some(client)) => {
            info!(%path, version = ?options.persistence_zk_version, "using coordinated persistence");
            Arc::new(CoordinatedPersistence::new(
                Arc::clone(client),
                path.clone(),
                options.persistence_zk_version,
            )?)
        }
        (Some(path), None) => {
            return Err(BootstrapError::Config(format!(
                "persistence path {path} given but coordination is disabled"
            )));
        }
        (None, _) => {
            let path = &options.persistence_local_path;
            info!(path = %path.display(), "using local file persistence");
            Arc::new(FileSystemPersistence::new(path))
        }
    };
    Ok(Arc::new(EncodingPersistenceLayer::<SchedulerState, _>::new(
        backend,
        JsonCodec::new(),
    )))
}

/// The on-disk update-configuration index, when one is configured.
///
/// The file is opened once and reused across leadership terms; each term
/// overwrites it with the recovered snapshot.
pub fn update_index(
    options: &SchedulerOptions,
) -> BootstrapResult<Option<Arc<RedbUpdateStore>>> {
    let Some(path) = &options.update_store_path else {
        return Ok(None);
    };
    info!(path = %path.display(), "using redb update index");
    Ok(Some(Arc::new(RedbUpdateStore::open(path)?)))
}

pub fn resource_manager(options: &SchedulerOptions) -> Arc<dyn ResourceManager> {
    Arc::new(InProcessMaster::new(options.master.clone()))
}

/// A scheduler that has won leadership, recovered its state, and
/// registered with the master.
#[derive(Debug)]
pub struct Leader {
    pub leadership: Leadership,
    pub storage: Arc<SchedulerStorage>,
    pub connection: Connection,
}

/// The wired-up scheduler, before or between terms as leader.
pub struct Scheduler {
    options: SchedulerOptions,
    coordination: Coordination,
    singleton: Option<SingletonService>,
    persistence: Arc<dyn PersistenceLayer<SchedulerState>>,
    update_index: Option<Arc<RedbUpdateStore>>,
    manager: Arc<dyn ResourceManager>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("options", &self.options)
            .field("coordination", &self.coordination)
            .field("update_index", &self.update_index)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Validate `options` and build every component. Configuration errors
    /// surface here, before any leadership is sought.
    pub async fn bootstrap(options: SchedulerOptions) -> BootstrapResult<Self> {
        options.validate()?;
        let coordination = coordination(&options).await?;
        let singleton = singleton_service(&coordination, &options);
        let persistence = persistence_layer(&coordination, &options)?;
        let update_index = update_index(&options)?;
        let manager = resource_manager(&options);
        info!(
            coordinated = coordination.is_enabled(),
            master = %options.master,
            "scheduler bootstrapped"
        );
        Ok(Self {
            options,
            coordination,
            singleton,
            persistence,
            update_index,
            manager,
        })
    }

    /// Replace the resource manager, e.g. to share one master between
    /// schedulers in the same process.
    pub fn with_resource_manager(mut self, manager: Arc<dyn ResourceManager>) -> Self {
        self.manager = manager;
        self
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn coordination(&self) -> &Coordination {
        &self.coordination
    }

    /// Acquire leadership, recover state, and register with the master.
    ///
    /// Returns `Ok(None)` if `shutdown` fires while waiting for leadership.
    /// Without coordination this process leads implicitly. If recovery or
    /// registration fails after leadership was won, leadership is given up
    /// before the error is returned.
    pub async fn lead(&self, shutdown: watch::Receiver<bool>) -> BootstrapResult<Option<Leader>> {
        let leadership = match &self.singleton {
            Some(singleton) => {
                info!(group = %singleton.group_path(), "campaigning for leadership");
                match singleton.campaign(&self.options.advertise, shutdown).await? {
                    Some(leadership) => leadership,
                    None => return Ok(None),
                }
            }
            None => Leadership::implicit(),
        };

        match self.take_office(leadership.clone()).await {
            Ok(leader) => Ok(Some(leader)),
            Err(e) => {
                warn!(error = %e, "startup as leader failed, resigning");
                if let Err(resign) = leadership.resign().await {
                    warn!(error = %resign, "failed to resign leadership");
                }
                Err(e)
            }
        }
    }

    async fn take_office(&self, leadership: Leadership) -> BootstrapResult<Leader> {
        let persistence = Arc::clone(&self.persistence);
        let storage = match &self.update_index {
            Some(index) => {
                let index: Arc<dyn MutableUpdateStore> = index.clone();
                SchedulerStorage::recover_with_index(persistence, index, leadership.clone()).await?
            }
            None => SchedulerStorage::recover(persistence, leadership.clone()).await?,
        };
        let storage = Arc::new(storage);
        let connection = FrameworkReconnector::new(
            Arc::clone(&storage),
            Arc::clone(&self.manager),
            self.options.master.clone(),
            self.options.framework_name.clone(),
        )
        .connect()
        .await?;

        Ok(Leader {
            leadership,
            storage,
            connection,
        })
    }

    /// End the coordination session, releasing any claims it holds.
    pub async fn close(&self) {
        if let Some(client) = self.coordination.client() {
            if let Err(e) = client.close().await {
                warn!(error = %e, "failed to close coordination session");
            }
        }
    }
}
