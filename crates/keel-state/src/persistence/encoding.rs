use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::{BlobPersistence, PersistenceLayer};
use crate::codec::Codec;
use crate::error::StateResult;

/// Typed slot layered over a byte backend.
///
/// `set` encodes then stores; `get` loads then decodes. An empty backend
/// reads as `None` without consulting the codec, and bytes the codec
/// rejects surface as [`StateError::Decode`](crate::StateError::Decode).
pub struct EncodingPersistenceLayer<T, C> {
    backend: Arc<BlobPersistence>,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> EncodingPersistenceLayer<T, C> {
    pub fn new(backend: Arc<BlobPersistence>, codec: C) -> Self {
        Self {
            backend,
            codec,
            _marker: PhantomData,
        }
    }

    pub fn backend(&self) -> &Arc<BlobPersistence> {
        &self.backend
    }
}

impl<T, C: fmt::Debug> fmt::Debug for EncodingPersistenceLayer<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodingPersistenceLayer")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, C> PersistenceLayer<T> for EncodingPersistenceLayer<T, C>
where
    T: Send + Sync,
    C: Codec<T>,
{
    async fn get(&self) -> StateResult<Option<T>> {
        match self.backend.get().await? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, value: &T) -> StateResult<()> {
        let bytes = self.codec.encode(value)?;
        self.backend.set(&bytes).await
    }
}
