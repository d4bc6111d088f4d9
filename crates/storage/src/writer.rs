//! Buffered, per-partition writer.
//!
//! Records are queued in memory per partition key (`model` or
//! `model/type`). A queue that reaches `flush_size` is flushed on the
//! calling thread: the existing partition file is read back, merged with the
//! queue by id, re-indexed and rewritten in full.
//!
//! Each partition owns a mutex that is held for the whole flush, so at most
//! one flush per key is ever in flight. Distinct partitions never share a
//! lock and flush in parallel from [`PartitionWriter::flush`].

use crate::config::WriterConfig;
use crate::error::{StorageError, StorageResult};
use crate::format::{merge_records, serialize, FileMetadata, IndexType, PartitionFile};
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use wikivec_core::{ArticleType, EmbeddingModel, EmbeddingRecord};
use wikivec_index::{IndexBlob, IndexError, IvfPqBuilder};

/// File extension for partition files.
pub const PARTITION_EXTENSION: &str = "wvec";

/// Identifies one partition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub model: EmbeddingModel,
    pub article_type: Option<ArticleType>,
}

impl PartitionKey {
    pub fn for_record(record: &EmbeddingRecord, by_type: bool) -> Self {
        Self {
            model: record.model,
            article_type: by_type.then_some(record.article_type),
        }
    }

    /// `<base>/<model>.wvec` or `<base>/<model>/<type>.wvec`.
    pub fn path(&self, base_dir: &Path) -> PathBuf {
        match self.article_type {
            None => base_dir.join(format!("{}.{}", self.model, PARTITION_EXTENSION)),
            Some(ty) => base_dir
                .join(self.model.as_str())
                .join(format!("{}.{}", ty, PARTITION_EXTENSION)),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.article_type {
            None => write!(f, "{}", self.model),
            Some(ty) => write!(f, "{}/{}", self.model, ty),
        }
    }
}

/// Lifecycle of one partition queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    Empty,
    Buffering,
    Flushing,
}

impl PartitionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PartitionState::Buffering,
            2 => PartitionState::Flushing,
            _ => PartitionState::Empty,
        }
    }
}

/// Point-in-time view of a single partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStats {
    pub key: String,
    pub path: PathBuf,
    pub state: PartitionState,
    pub buffered: usize,
    pub rows_on_disk: usize,
    pub flushes: usize,
}

/// Point-in-time view of the writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriterStats {
    /// Records committed to disk across all flushes.
    pub total_written: usize,
    /// Records accepted but not yet flushed.
    pub total_buffered: usize,
    pub flushes: usize,
    pub partitions: Vec<PartitionStats>,
}

struct PartitionBuffer {
    records: Vec<EmbeddingRecord>,
    /// Established by the on-disk file or the first accepted record.
    dimension: Option<usize>,
}

struct Partition {
    key: PartitionKey,
    path: PathBuf,
    state: AtomicU8,
    buffered: AtomicUsize,
    rows_on_disk: AtomicUsize,
    flushes: AtomicUsize,
    buffer: Mutex<PartitionBuffer>,
}

impl Partition {
    fn open(key: PartitionKey, base_dir: &Path) -> Self {
        let path = key.path(base_dir);

        // a file we cannot read yet establishes nothing; flush reports it
        let (dimension, rows) = match PartitionFile::open(&path) {
            Ok(file) if file.row_count() > 0 => (Some(file.dimension()), file.row_count()),
            _ => (None, 0),
        };
        if let Some(dim) = dimension {
            tracing::debug!("Partition {} exists: {} rows of dim {}", key, rows, dim);
        }

        Self {
            key,
            path,
            state: AtomicU8::new(PartitionState::Empty as u8),
            buffered: AtomicUsize::new(0),
            rows_on_disk: AtomicUsize::new(rows),
            flushes: AtomicUsize::new(0),
            buffer: Mutex::new(PartitionBuffer {
                records: Vec::new(),
                dimension,
            }),
        }
    }

    fn set_state(&self, state: PartitionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stats(&self) -> PartitionStats {
        PartitionStats {
            key: self.key.to_string(),
            path: self.path.clone(),
            state: PartitionState::from_u8(self.state.load(Ordering::Acquire)),
            buffered: self.buffered.load(Ordering::Relaxed),
            rows_on_disk: self.rows_on_disk.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// Buffers records per partition and rewrites partition files on flush.
///
/// All methods take `&self`; the writer can be shared across threads.
pub struct PartitionWriter {
    config: WriterConfig,
    builder: IvfPqBuilder,
    partitions: Mutex<HashMap<PartitionKey, Arc<Partition>>>,
    total_written: AtomicUsize,
    total_buffered: AtomicUsize,
    flushes: AtomicUsize,
}

impl PartitionWriter {
    pub fn new(config: WriterConfig) -> Self {
        tracing::info!(
            "Partition writer at {:?}: flush_size={}, partition_by_type={}",
            config.base_dir,
            config.flush_size,
            config.partition_by_type
        );
        Self {
            builder: IvfPqBuilder::new(config.index.clone()),
            config,
            partitions: Mutex::new(HashMap::new()),
            total_written: AtomicUsize::new(0),
            total_buffered: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    fn flush_size(&self) -> usize {
        self.config.flush_size.max(1)
    }

    fn partition(&self, key: PartitionKey) -> Arc<Partition> {
        let mut partitions = self.partitions.lock();
        partitions
            .entry(key)
            .or_insert_with(|| Arc::new(Partition::open(key, &self.config.base_dir)))
            .clone()
    }

    /// Buffer one record, flushing its partition if the queue is full.
    pub fn write(&self, record: EmbeddingRecord) -> StorageResult<()> {
        self.write_batch(vec![record])
    }

    /// Buffer a batch of records.
    ///
    /// The batch is validated against every partition it touches before any
    /// record is queued: one record with the wrong dimension rejects the lot.
    /// Partitions that reach `flush_size` are flushed before returning.
    pub fn write_batch(&self, records: Vec<EmbeddingRecord>) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut grouped: HashMap<PartitionKey, Vec<EmbeddingRecord>> = HashMap::new();
        for record in records {
            let key = PartitionKey::for_record(&record, self.config.partition_by_type);
            grouped.entry(key).or_default().push(record);
        }

        // lock in path order so concurrent batches cannot deadlock
        let mut groups: Vec<(Arc<Partition>, Vec<EmbeddingRecord>)> = grouped
            .into_iter()
            .map(|(key, records)| (self.partition(key), records))
            .collect();
        groups.sort_by(|a, b| a.0.path.cmp(&b.0.path));
        let (partitions, batches): (Vec<_>, Vec<_>) = groups.into_iter().unzip();

        let mut guards: Vec<MutexGuard<'_, PartitionBuffer>> =
            partitions.iter().map(|p| p.buffer.lock()).collect();

        for (guard, batch) in guards.iter().zip(&batches) {
            let expected = guard.dimension.unwrap_or_else(|| batch[0].dimension());
            if let Some(bad) = batch.iter().find(|r| r.dimension() != expected) {
                tracing::warn!(
                    "Rejecting batch: record {} has dimension {}, partition expects {}",
                    bad.id,
                    bad.dimension(),
                    expected
                );
                return Err(StorageError::DimensionMismatch {
                    expected,
                    got: bad.dimension(),
                });
            }
        }

        let mut full = Vec::new();
        for ((guard, batch), partition) in guards.iter_mut().zip(batches).zip(&partitions) {
            let n = batch.len();
            guard.dimension.get_or_insert(batch[0].dimension());
            guard.records.extend(batch);

            partition.buffered.store(guard.records.len(), Ordering::Relaxed);
            partition.set_state(PartitionState::Buffering);
            self.total_buffered.fetch_add(n, Ordering::Relaxed);

            if guard.records.len() >= self.flush_size() {
                full.push(partition.clone());
            }
        }
        drop(guards);

        for partition in full {
            self.flush_partition(&partition, false)?;
        }
        Ok(())
    }

    /// Write every non-empty queue, one thread per partition.
    ///
    /// Returns the number of records committed. When some partitions fail,
    /// the others are still written and the first error is returned.
    pub fn flush(&self) -> StorageResult<usize> {
        let partitions: Vec<Arc<Partition>> = self.partitions.lock().values().cloned().collect();

        let results: Vec<StorageResult<usize>> = partitions
            .par_iter()
            .map(|p| self.flush_partition(p, true))
            .collect();

        let mut written = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(n) => written += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Flush everything and report final counters.
    pub fn finalize(&self) -> StorageResult<WriterStats> {
        self.flush()?;
        let stats = self.stats();
        tracing::info!(
            "Writer finalized: {} records written in {} flushes across {} partitions",
            stats.total_written,
            stats.flushes,
            stats.partitions.len()
        );
        Ok(stats)
    }

    pub fn stats(&self) -> WriterStats {
        let mut partitions: Vec<PartitionStats> =
            self.partitions.lock().values().map(|p| p.stats()).collect();
        partitions.sort_by(|a, b| a.key.cmp(&b.key));

        WriterStats {
            total_written: self.total_written.load(Ordering::Relaxed),
            total_buffered: self.total_buffered.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            partitions,
        }
    }

    /// Flush one partition under its lock. Unless `force`, only a full queue is written.
    fn flush_partition(&self, partition: &Partition, force: bool) -> StorageResult<usize> {
        let mut buffer = partition.buffer.lock();
        let pending = buffer.records.len();
        if pending == 0 || (!force && pending < self.flush_size()) {
            return Ok(0);
        }

        partition.set_state(PartitionState::Flushing);
        match self.rewrite_partition(partition, &buffer.records) {
            Ok(rows) => {
                buffer.records.clear();
                partition.buffered.store(0, Ordering::Relaxed);
                partition.rows_on_disk.store(rows, Ordering::Relaxed);
                partition.flushes.fetch_add(1, Ordering::Relaxed);
                partition.set_state(PartitionState::Empty);

                self.total_written.fetch_add(pending, Ordering::Relaxed);
                self.total_buffered.fetch_sub(pending, Ordering::Relaxed);
                self.flushes.fetch_add(1, Ordering::Relaxed);
                Ok(pending)
            }
            Err(e) => {
                partition.set_state(PartitionState::Buffering);
                tracing::error!(
                    "Flush of partition {} failed, keeping {} buffered records: {}",
                    partition.key,
                    pending,
                    e
                );
                Err(e)
            }
        }
    }

    /// Read-merge-write of one partition file. Returns the new row count.
    fn rewrite_partition(
        &self,
        partition: &Partition,
        buffered: &[EmbeddingRecord],
    ) -> StorageResult<usize> {
        let dim = buffered[0].dimension();
        let existing = read_existing(&partition.path)?;

        let mut created_at = None;
        let mut existing_records = Vec::new();
        if let Some((meta, records)) = existing {
            if meta.row_count > 0 && meta.embedding_dimension != dim {
                return Err(StorageError::PartitionConflict {
                    path: partition.path.clone(),
                    on_disk: meta.embedding_dimension,
                    buffered: dim,
                });
            }
            created_at = Some(meta.created_at);
            existing_records = records;
        }

        tracing::info!(
            "Flushing {} records to partition {} ({} rows on disk)",
            buffered.len(),
            partition.key,
            existing_records.len()
        );

        let merged = merge_records(existing_records, buffered.to_vec());
        let (index_type, index) = self.build_index(&partition.key, &merged, dim)?;

        let mut meta = FileMetadata::new(partition.key.model, dim, merged.len())
            .with_partition_key(partition.key.to_string());
        if let Some(created_at) = created_at {
            meta.created_at = created_at;
        }
        meta.index_type = index_type;
        meta.index_config = index.as_ref().map(|blob| blob.config.clone());

        let bytes = serialize(&merged, &meta, index.as_ref())?;
        replace_file(&partition.path, &bytes)?;

        tracing::debug!(
            "Wrote {} ({} rows, {} bytes, index {:?})",
            partition.path.display(),
            merged.len(),
            bytes.len(),
            index_type
        );
        Ok(merged.len())
    }

    fn build_index(
        &self,
        key: &PartitionKey,
        records: &[EmbeddingRecord],
        dim: usize,
    ) -> StorageResult<(IndexType, Option<IndexBlob>)> {
        let n = records.len();
        let unindexed = if n >= self.config.flat_threshold {
            IndexType::Flat
        } else {
            IndexType::None
        };
        if n < self.config.index.num_partitions {
            return Ok((unindexed, None));
        }

        let vectors: Vec<f32> = records
            .iter()
            .flat_map(|r| r.embedding.iter().copied())
            .collect();
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        match self.builder.build(&vectors, dim, &mut rng) {
            Ok(blob) => Ok((IndexType::IvfPq, Some(blob))),
            Err(IndexError::Precondition { dim, sub_quantizers }) => {
                tracing::warn!(
                    "Skipping IVF-PQ index for partition {}: dimension {} not divisible by {} sub-quantizers",
                    key,
                    dim,
                    sub_quantizers
                );
                Ok((unindexed, None))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Metadata and records of the current partition file, if one exists.
///
/// A file that is not a valid partition file is logged and treated as empty
/// so the flush overwrites it; I/O errors propagate.
fn read_existing(path: &Path) -> StorageResult<Option<(FileMetadata, Vec<EmbeddingRecord>)>> {
    if !path.exists() {
        return Ok(None);
    }
    let loaded = PartitionFile::open(path).and_then(|file| {
        let records = file.records()?;
        Ok((file.metadata().clone(), records))
    });
    match loaded {
        Ok(existing) => Ok(Some(existing)),
        Err(e) if e.is_format_error() => {
            tracing::warn!(
                "Ignoring unreadable partition file {}: {}",
                path.display(),
                e
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
fn replace_file(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, model: EmbeddingModel, ty: ArticleType, embedding: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id: id.to_string(),
            title: id.to_uppercase(),
            article_type: ty,
            chunk_index: 0,
            text_preview: String::new(),
            embedding,
            model,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_partition_key_paths() {
        let base = Path::new("/data");
        let r = record("x", EmbeddingModel::BgeSmall, ArticleType::Person, vec![0.0]);

        let by_model = PartitionKey::for_record(&r, false);
        assert_eq!(by_model.to_string(), "bge-small");
        assert_eq!(by_model.path(base), PathBuf::from("/data/bge-small.wvec"));

        let by_type = PartitionKey::for_record(&r, true);
        assert_eq!(by_type.to_string(), "bge-small/person");
        assert_eq!(by_type.path(base), PathBuf::from("/data/bge-small/person.wvec"));
    }

    #[test]
    fn test_batch_with_bad_dimension_is_rejected_whole() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(WriterConfig::new(dir.path()).with_flush_size(100));
        writer
            .write(record("a", EmbeddingModel::MiniLm, ArticleType::Place, vec![1.0, 2.0]))
            .unwrap();

        let batch = vec![
            record("b", EmbeddingModel::MiniLm, ArticleType::Place, vec![1.0, 2.0]),
            record("c", EmbeddingModel::Nomic, ArticleType::Place, vec![1.0, 2.0, 3.0]),
            record("d", EmbeddingModel::MiniLm, ArticleType::Place, vec![1.0]),
        ];
        let err = writer.write_batch(batch).unwrap_err();

        assert!(matches!(err, StorageError::DimensionMismatch { expected: 2, got: 1 }));
        let stats = writer.stats();
        assert_eq!(stats.total_buffered, 1);
        assert!(stats.partitions.iter().all(|p| p.key != "nomic" || p.buffered == 0));
    }

    #[test]
    fn test_first_record_establishes_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(WriterConfig::new(dir.path()));

        let batch = vec![
            record("a", EmbeddingModel::MiniLm, ArticleType::Event, vec![1.0, 2.0, 3.0]),
            record("b", EmbeddingModel::MiniLm, ArticleType::Event, vec![1.0, 2.0]),
        ];
        assert!(matches!(
            writer.write_batch(batch),
            Err(StorageError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert_eq!(writer.stats().total_buffered, 0);
    }

    #[test]
    fn test_stats_track_state() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(WriterConfig::new(dir.path()).with_flush_size(10));
        writer
            .write(record("a", EmbeddingModel::E5Base, ArticleType::Work, vec![0.5]))
            .unwrap();

        let stats = writer.stats();
        assert_eq!(stats.partitions.len(), 1);
        assert_eq!(stats.partitions[0].state, PartitionState::Buffering);
        assert_eq!(stats.partitions[0].buffered, 1);

        assert_eq!(writer.flush().unwrap(), 1);
        let stats = writer.stats();
        assert_eq!(stats.partitions[0].state, PartitionState::Empty);
        assert_eq!(stats.partitions[0].rows_on_disk, 1);
        assert_eq!(stats.flushes, 1);

        // nothing pending: no new flush
        assert_eq!(writer.flush().unwrap(), 0);
        assert_eq!(writer.stats().flushes, 1);
    }

    #[test]
    fn test_replace_file_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/minilm.wvec");
        replace_file(&path, b"first").unwrap();
        replace_file(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!dir.path().join("nested/minilm.wvec.tmp").exists());
    }
}
