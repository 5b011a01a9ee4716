use crate::codec::Codec;
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Characters kept by the tokenizer; everything else becomes a space.
pub const DEFAULT_INDEX_CHARS: &str = " abcdefghijklmnopqrstuvwxyz1234567890";

/// Store configuration, usually parsed from a `nodestore.yaml` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory every schema path is relative to
    pub root: PathBuf,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    #[serde(default = "default_queue_max_execution_secs")]
    pub queue_max_execution_secs: u64,
    #[serde(default = "default_index_chars")]
    pub index_chars: String,
}

fn default_lock_timeout_secs() -> u64 {
    60
}

fn default_lock_poll_ms() -> u64 {
    10
}

fn default_queue_max_execution_secs() -> u64 {
    60
}

fn default_index_chars() -> String {
    DEFAULT_INDEX_CHARS.to_string()
}

impl StoreConfig {
    /// Default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            codec: Codec::default(),
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_poll_ms: default_lock_poll_ms(),
            queue_max_execution_secs: default_queue_max_execution_secs(),
            index_chars: default_index_chars(),
        }
    }

    /// Parse a YAML config file. A relative `root` is resolved against the
    /// directory containing the file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse_str(&content)?;
        if config.root.is_relative() {
            if let Some(dir) = path.parent() {
                config.root = dir.join(&config.root);
            }
        }
        Ok(config)
    }

    /// Parse a YAML config string.
    pub fn parse_str(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.lock_poll_ms == 0 {
            return Err(StoreError::Config("lock_poll_ms must be positive".into()));
        }
        if self.index_chars.is_empty() {
            return Err(StoreError::Config("index_chars must not be empty".into()));
        }
        // tokens become directory names
        if self.index_chars.contains(['/', '\\', '.']) {
            return Err(StoreError::Config(
                "index_chars must not contain path separators or '.'".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }

    pub fn queue_max_execution(&self) -> Duration {
        Duration::from_secs(self.queue_max_execution_secs)
    }
}
