//! Runtime configuration for a book node.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Book node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    /// Node identity, reported in persistence diagnostics
    pub node_id: String,
    /// Directory holding the journal and snapshot; `None` keeps the book in memory
    pub data_dir: Option<PathBuf>,
    /// How long startup waits for the store to become ready
    pub ready_timeout_ms: u64,
    /// Journal units between snapshots (0 = never compact)
    pub compact_after: u64,
    /// Capacity of the instruction channel feeding the writer thread
    pub channel_capacity: usize,
    /// Pin the writer thread to the last available CPU core
    pub pin_to_core: bool,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            node_id: "ladder-node".to_string(),
            data_dir: None,
            ready_timeout_ms: 5_000,
            compact_after: 10_000,
            channel_capacity: 1_024,
            pin_to_core: false,
        }
    }
}

impl BookConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Durable configuration rooted at `dir`
    pub fn durable(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    #[inline]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BookConfig::default();
        assert!(config.data_dir.is_none());
        assert_eq!(config.ready_timeout(), Duration::from_secs(5));
        assert_eq!(config.channel_capacity, 1_024);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"node_id": "book-7", "compact_after": 0}}"#).unwrap();

        let config = BookConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_id, "book-7");
        assert_eq!(config.compact_after, 0);
        assert_eq!(config.ready_timeout_ms, 5_000);
    }

    #[test]
    fn test_malformed_file_is_codec_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = BookConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, crate::BookError::Codec(_)));
    }
}
