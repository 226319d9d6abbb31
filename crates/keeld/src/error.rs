use keel_coord::CoordError;
use keel_scheduler::SchedulerError;
use keel_state::StateError;
use thiserror::Error;

pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Errors raised while wiring up or starting the scheduler.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Inconsistent or unusable configuration; fatal.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Coordination(#[from] CoordError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
