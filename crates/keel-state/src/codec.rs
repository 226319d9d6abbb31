//! Reversible value ↔ bytes conversion.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StateError, StateResult};

/// Converts values of `T` to and from an opaque byte representation.
///
/// `decode(encode(v)) == v` must hold for every value `encode` accepts.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> StateResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> StateResult<T>;
}

/// JSON codec over any serde type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> StateResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StateError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> StateResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StateError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FrameworkId, JobKey, JobUpdateConfiguration, SchedulerState};

    #[test]
    fn scheduler_state_survives_json() {
        let codec = JsonCodec::<SchedulerState>::new();
        let state = SchedulerState {
            framework_id: Some(FrameworkId::new("fw-0001")),
            update_configs: vec![JobUpdateConfiguration::new(
                JobKey::new("www-data", "frontend"),
                "token-1",
            )],
        };
        let bytes = codec.encode(&state).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), state);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let codec = JsonCodec::<SchedulerState>::new();
        let err = codec.decode(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, StateError::Decode(_)));
    }
}
