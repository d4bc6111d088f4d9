//! Storage layer for wikivec.
//!
//! Provides the columnar partition file format and the buffered partition
//! writer that merges, indexes and rewrites those files.

pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod index_blob;
pub mod writer;

pub use config::WriterConfig;
pub use error::{StorageError, StorageResult};
pub use format::{
    merge_records, serialize, Column, ColumnData, ColumnSchema, ColumnType, FileHeader,
    FileMetadata, Footer, IndexType, PartitionFile, FILE_MAGIC, FOOTER_SIZE, FORMAT_VERSION,
    HEADER_SIZE,
};
pub use index_blob::{decode_index_blob, encode_index_blob};
pub use writer::{PartitionKey, PartitionState, PartitionStats, PartitionWriter, WriterStats};
