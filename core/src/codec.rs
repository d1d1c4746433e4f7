use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Converts a handler argument to the bytes kept in a retry task and back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// `serde_json`; readable payloads, tolerant of added fields.
    #[default]
    Json,
    /// `bincode`; compact, but the argument type must not change shape.
    Bincode,
}

impl Codec {
    /// Serialize `arg` for storage.
    pub fn encode<T: Serialize>(&self, arg: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(arg)?),
            Codec::Bincode => Ok(bincode::serialize(arg)?),
        }
    }

    /// Rebuild an argument from stored bytes.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Bincode => Ok(bincode::deserialize(bytes)?),
        }
    }
}
