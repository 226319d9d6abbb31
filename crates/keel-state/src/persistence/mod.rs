//! Single-slot durable persistence.
//!
//! A [`PersistenceLayer`] holds at most one value. Byte-level backends
//! ([`FileSystemPersistence`], [`CoordinatedPersistence`],
//! [`MemoryPersistence`]) store opaque blobs; [`EncodingPersistenceLayer`]
//! adapts any of them to a typed value through a [`Codec`](crate::Codec).

mod coordinated;
mod encoding;
mod filesystem;
mod memory;

use async_trait::async_trait;

use crate::error::StateResult;

pub use coordinated::CoordinatedPersistence;
pub use encoding::EncodingPersistenceLayer;
pub use filesystem::FileSystemPersistence;
pub use memory::MemoryPersistence;

/// A durable slot holding at most one value of `T`.
///
/// `get` returns `None` until the first successful `set`; afterwards it
/// returns the most recently set value, also across restarts.
#[async_trait]
pub trait PersistenceLayer<T>: Send + Sync
where
    T: Send + Sync,
{
    async fn get(&self) -> StateResult<Option<T>>;
    async fn set(&self, value: &T) -> StateResult<()>;
}

/// Byte-level backend, as wrapped by [`EncodingPersistenceLayer`].
pub type BlobPersistence = dyn PersistenceLayer<Vec<u8>>;
