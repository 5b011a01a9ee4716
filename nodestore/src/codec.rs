// Value codec - the byte encoding of a node file

use crate::error::Result;
use crate::Document;
use serde::{Deserialize, Serialize};

/// Encoding used for every node file of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    Json,
    Yaml,
}

impl Codec {
    pub fn encode(&self, value: &Document) -> Result<Vec<u8>> {
        Ok(match self {
            Codec::Json => serde_json::to_vec(value)?,
            Codec::Yaml => serde_yaml::to_string(value)?.into_bytes(),
        })
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Document> {
        Ok(match self {
            Codec::Json => serde_json::from_slice(bytes)?,
            Codec::Yaml => serde_yaml::from_slice(bytes)?,
        })
    }
}
