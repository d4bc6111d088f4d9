//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;
use wikivec_index::IndexError;

/// Storage-related errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid partition file magic bytes")]
    InvalidMagic,

    #[error("Unsupported partition file version: {0}")]
    UnsupportedVersion(u32),

    #[error("Malformed partition file: {0}")]
    Format(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The file on disk changed dimension under buffered records.
    #[error("Partition file {} holds {on_disk}-d embeddings, buffer holds {buffered}-d", path.display())]
    PartitionConflict {
        path: PathBuf,
        on_disk: usize,
        buffered: usize,
    },

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        StorageError::Format(msg.into())
    }

    /// True for every error that means "these bytes are not a valid partition file".
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidMagic
                | StorageError::UnsupportedVersion(_)
                | StorageError::Format(_)
                | StorageError::Index(IndexError::Corrupt(_))
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
