use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::PersistenceLayer;
use crate::error::{StateError, StateResult};

/// Volatile byte slot for tests and single-shot runs.
///
/// Writes can be made to fail on demand with [`fail_writes`](Self::fail_writes)
/// to exercise error paths in callers.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<Vec<u8>>>,
    failing: Mutex<bool>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `bytes` already stored.
    pub fn with_contents(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            slot: Mutex::new(Some(bytes.into())),
            failing: Mutex::new(false),
        }
    }

    pub fn fail_writes(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    /// Current contents, bypassing any codec.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PersistenceLayer<Vec<u8>> for MemoryPersistence {
    async fn get(&self) -> StateResult<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    async fn set(&self, value: &Vec<u8>) -> StateResult<()> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(StateError::Io {
                path: "memory".to_string(),
                source: std::io::Error::other("injected write failure"),
            });
        }
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_until_first_set() {
        let slot = MemoryPersistence::new();
        assert_eq!(slot.get().await.unwrap(), None);
        slot.set(&b"one".to_vec()).await.unwrap();
        slot.set(&b"two".to_vec()).await.unwrap();
        assert_eq!(slot.get().await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_value() {
        let slot = MemoryPersistence::with_contents(b"kept".to_vec());
        slot.fail_writes(true);
        assert!(slot.set(&b"lost".to_vec()).await.is_err());
        assert_eq!(slot.contents(), Some(b"kept".to_vec()));
    }
}
