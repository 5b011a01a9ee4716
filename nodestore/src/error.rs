use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid node id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("Invalid schema name: {0}")]
    InvalidSchema(String),

    #[error("Node already exists: {schema}/{id}")]
    Conflict { schema: String, id: String },

    #[error("Timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Corrupt record at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StoreError {
    /// True when the error is a lock acquisition that ran out of time.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
