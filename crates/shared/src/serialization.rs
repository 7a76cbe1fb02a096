//! Serialization seam for typed payloads.
//!
//! Domain systems serialize their payloads through this trait before handing
//! bytes to the dispatcher, so the wire encoding stays swappable in one
//! place.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub trait MessageSerializer: Send + Sync + 'static {
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, SerializationError>
    where
        T: Serialize;

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T, SerializationError>
    where
        T: DeserializeOwned;
}

/// Standard implementation backed by `bincode`.
#[derive(Debug, Default)]
pub struct BincodeSerializer;

impl MessageSerializer for BincodeSerializer {
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, SerializationError>
    where
        T: Serialize,
    {
        bincode::serialize(value).map_err(SerializationError::Encode)
    }

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T, SerializationError>
    where
        T: DeserializeOwned,
    {
        bincode::deserialize(bytes).map_err(SerializationError::Decode)
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("bincode encode error: {0}")]
    Encode(bincode::Error),
    #[error("bincode decode error: {0}")]
    Decode(bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_the_seam() {
        let serializer = BincodeSerializer;
        let bytes = serializer.serialize(&(42u32, "vessel".to_string())).unwrap();
        let (num, name): (u32, String) = serializer.deserialize(&bytes).unwrap();
        assert_eq!(num, 42);
        assert_eq!(name, "vessel");
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        let serializer = BincodeSerializer;
        let result: Result<(u32, String), _> = serializer.deserialize(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(SerializationError::Decode(_))));
    }
}
