//! keel-scheduler — the scheduler core's durable-state backbone.
//!
//! - **`storage`** — [`SchedulerStorage`], the leader-gated write-through
//!   store of scheduler state that also serves as the update store
//! - **`driver`** — the [`ResourceManager`] boundary and [`InProcessMaster`]
//! - **`reconnect`** — [`FrameworkReconnector`], (re)registration under the
//!   durable framework identity

pub mod driver;
pub mod error;
pub mod reconnect;
pub mod storage;

pub use driver::{InProcessMaster, RegistrationRequest, ResourceManager};
pub use error::{SchedulerError, SchedulerResult};
pub use reconnect::{Connection, FrameworkReconnector};
pub use storage::SchedulerStorage;
