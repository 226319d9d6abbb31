//! Error types for the scheduler core.

use keel_coord::CoordError;
use keel_state::StateError;
use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state error: {0}")]
    State(StateError),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("not the leader")]
    NotLeader,
}

impl From<StateError> for SchedulerError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotLeader => SchedulerError::NotLeader,
            other => SchedulerError::State(other),
        }
    }
}

impl From<CoordError> for SchedulerError {
    fn from(err: CoordError) -> Self {
        StateError::from(err).into()
    }
}
