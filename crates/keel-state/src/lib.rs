//! keel-state — durable scheduler state for Keel.
//!
//! # Architecture
//!
//! - **`types`** — the persisted [`SchedulerState`] snapshot and rolling
//!   update records
//! - **`codec`** — [`Codec`] and the JSON implementation
//! - **`persistence`** — single-slot [`PersistenceLayer`]s over a local
//!   file, a coordination-service node, or memory, plus the typed
//!   [`EncodingPersistenceLayer`]
//! - **`update_store`** — [`UpdateStore`] / [`MutableUpdateStore`] with
//!   in-memory and redb-backed implementations

pub mod codec;
pub mod error;
pub mod persistence;
pub mod tables;
pub mod types;
pub mod update_store;

pub use codec::{Codec, JsonCodec};
pub use error::{StateError, StateResult};
pub use persistence::{
    BlobPersistence, CoordinatedPersistence, EncodingPersistenceLayer, FileSystemPersistence,
    MemoryPersistence, PersistenceLayer,
};
pub use types::*;
pub use update_store::{MemUpdateStore, MutableUpdateStore, RedbUpdateStore, UpdateStore};
