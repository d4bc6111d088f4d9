//! Writer configuration.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use wikivec_index::IvfPqConfig;

/// Configuration for a [`PartitionWriter`](crate::PartitionWriter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Directory partition files are written under.
    pub base_dir: PathBuf,

    /// Buffered records per partition before a synchronous flush.
    pub flush_size: usize,

    /// Split each model's partition further by article type.
    pub partition_by_type: bool,

    /// IVF-PQ parameters. A partition gets an index once it holds at least
    /// `index.num_partitions` rows.
    pub index: IvfPqConfig,

    /// Row count at which an unindexed partition is marked `FLAT` instead of `NONE`.
    pub flat_threshold: usize,

    /// Seed for index construction. None = fresh entropy per flush.
    pub seed: Option<u64>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data"),
            flush_size: 1000,
            partition_by_type: false,
            index: IvfPqConfig::default(),
            flat_threshold: 1000,
            seed: None,
        }
    }
}

impl WriterConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn with_flush_size(mut self, flush_size: usize) -> Self {
        self.flush_size = flush_size;
        self
    }

    pub fn with_partition_by_type(mut self, partition_by_type: bool) -> Self {
        self.partition_by_type = partition_by_type;
        self
    }

    pub fn with_index(mut self, index: IvfPqConfig) -> Self {
        self.index = index;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: WriterConfig =
            serde_json::from_str(r#"{"base_dir": "/tmp/vec", "flush_size": 5, "index": {"num_partitions": 8}}"#)
                .unwrap();

        assert_eq!(config.base_dir, PathBuf::from("/tmp/vec"));
        assert_eq!(config.flush_size, 5);
        assert!(!config.partition_by_type);
        assert_eq!(config.index.num_partitions, 8);
        assert_eq!(config.index.num_sub_quantizers, 16);
        assert_eq!(config.flat_threshold, 1000);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("writer.json");
        let config = WriterConfig::new(dir.path()).with_flush_size(3).with_seed(7);
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(WriterConfig::load(&path).unwrap(), config);
        assert!(WriterConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
