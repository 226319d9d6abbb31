//! Error types for coordination-service operations.

use thiserror::Error;

use crate::client::Version;

/// Result type alias for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors returned by a [`CoordinationClient`](crate::CoordinationClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("no node at {0}")]
    NoNode(String),

    #[error("node already exists at {0}")]
    NodeExists(String),

    #[error("version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("coordination session expired")]
    SessionExpired,

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not the leader")]
    NotLeader,
}
