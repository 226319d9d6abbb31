//! Error types for the Keel state layer.

use keel_coord::{CoordError, Version};
use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while persisting or querying scheduler state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Optimistic-concurrency check failed. `None` on either side means
    /// "no node".
    #[error("version conflict at {path}: expected {expected:?}, found {actual:?}")]
    Conflict {
        path: String,
        expected: Option<Version>,
        actual: Option<Version>,
    },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid job key: {0}")]
    InvalidJobKey(String),

    #[error("coordination error: {0}")]
    Coordination(CoordError),

    #[error("not the leader; refusing to write")]
    NotLeader,

    /// A commit reached the backend but the local view could not follow.
    /// The view must be rebuilt by recovering again.
    #[error("local view diverged from committed state: {0}")]
    Diverged(String),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),
}

impl StateError {
    /// Whether the caller may re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}

impl From<CoordError> for StateError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::NotLeader => StateError::NotLeader,
            CoordError::BadVersion {
                path,
                expected,
                actual,
            } => StateError::Conflict {
                path,
                expected: Some(expected),
                actual: Some(actual),
            },
            other => StateError::Coordination(other),
        }
    }
}
