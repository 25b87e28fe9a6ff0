use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};

/// Serialize a record into the binary form kept in storage.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow::anyhow!("Serialization failed: {}", e))
}

/// Deserialize a stored record.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| anyhow::anyhow!("Deserialization failed: {}", e))
}
