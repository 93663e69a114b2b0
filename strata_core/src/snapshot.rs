use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConfigFormat, SourceTier};

/// A resolved configuration document together with its provenance.
///
/// `sequence` orders snapshots within one watch subscription: the initially
/// resolved document is sequence 0 and every accepted remote update
/// increments it by one. Snapshots are immutable values; an update replaces
/// the whole snapshot, never patches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub tier: SourceTier,
    pub sequence: u64,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl ConfigSnapshot {
    pub fn new(tier: SourceTier, data: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            tier,
            sequence: 0,
            data,
        }
    }

    pub fn with_sequence(
        tier: SourceTier,
        sequence: u64,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            tier,
            sequence,
            data,
        }
    }

    /// Parses a raw payload in the given format into a sequence-0 snapshot.
    pub fn parse(
        tier: SourceTier,
        format: ConfigFormat,
        bytes: &[u8],
    ) -> Result<Self, SnapshotError> {
        Ok(Self::new(tier, format.parse_object(bytes)?))
    }

    /// Builds the `Default`-tier snapshot from a compiled-in defaults value.
    ///
    /// The value must serialize to a JSON object; anything else is a
    /// programming error surfaced to the caller.
    pub fn from_defaults<T: Serialize>(defaults: &T) -> Result<Self, SnapshotError> {
        let value = serde_json::to_value(defaults).map_err(|e| SnapshotError::Decode {
            reason: e.to_string(),
        })?;
        match value {
            serde_json::Value::Object(map) => Ok(Self::new(SourceTier::Default, map)),
            _ => Err(SnapshotError::NotAnObject),
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Deserializes the whole document into a typed configuration struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SnapshotError> {
        serde_json::from_value(serde_json::Value::Object(self.data.clone())).map_err(|e| {
            SnapshotError::Decode {
                reason: e.to_string(),
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to parse {format} payload: {reason}")]
    Parse { format: ConfigFormat, reason: String },
    #[error("configuration root must be an object")]
    NotAnObject,
    #[error("failed to decode configuration into the requested type: {reason}")]
    Decode { reason: String },
}
