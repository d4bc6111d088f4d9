//! Partition file format.
//!
//! File layout:
//! ```text
//! HEADER (16 bytes):
//!   magic: "WVEC" (4 bytes)
//!   version: u32
//!   metadata_len: u32
//!   flags: u32 (bit 0 = index present)
//!
//! METADATA:
//!   UTF-8 JSON, metadata_len bytes
//!
//! COLUMNS (fixed order):
//!   id, title, type, chunk_index, text_preview, embedding, model, created_at
//!
//! INDEX (only when flags bit 0 is set):
//!   see `index_blob`
//!
//! FOOTER (72 bytes):
//!   9 x f64 LE absolute offsets: metadata, then each column in order
//! ```
//!
//! The footer sits at the end with absolute offsets so a reader holding only
//! the tail of the file can fetch a single column without touching the
//! others. Offsets are stored as f64, which represents every offset below
//! 2^53 exactly.

use crate::codec;
use crate::error::{StorageError, StorageResult};
use crate::index_blob::{decode_index_blob, encode_index_blob};
use chrono::{SecondsFormat, Utc};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use wikivec_core::{l2_distance_squared, ArticleType, EmbeddingModel, EmbeddingRecord};
use wikivec_index::{IndexBlob, IndexConfig, IndexHit};

/// Magic bytes for partition files.
pub const FILE_MAGIC: &[u8; 4] = b"WVEC";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 16;

/// Metadata offset plus one offset per column, 8 bytes each.
pub const FOOTER_SIZE: usize = 9 * 8;

/// Header flag: an index section follows the last column.
pub const FLAG_HAS_INDEX: u32 = 1;

/// The eight stored columns, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Id,
    Title,
    Type,
    ChunkIndex,
    TextPreview,
    Embedding,
    Model,
    CreatedAt,
}

impl Column {
    pub const ALL: [Column; 8] = [
        Column::Id,
        Column::Title,
        Column::Type,
        Column::ChunkIndex,
        Column::TextPreview,
        Column::Embedding,
        Column::Model,
        Column::CreatedAt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Title => "title",
            Column::Type => "type",
            Column::ChunkIndex => "chunk_index",
            Column::TextPreview => "text_preview",
            Column::Embedding => "embedding",
            Column::Model => "model",
            Column::CreatedAt => "created_at",
        }
    }

    pub fn column_type(self) -> ColumnType {
        match self {
            Column::ChunkIndex => ColumnType::Int32,
            Column::Embedding => ColumnType::Float32Vector,
            _ => ColumnType::Utf8,
        }
    }

    /// Position in file order (and footer slot minus one).
    pub fn position(self) -> usize {
        self as usize
    }

    pub fn from_name(name: &str) -> Option<Column> {
        Column::ALL.into_iter().find(|c| c.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "utf8")]
    Utf8,
    #[serde(rename = "int32")]
    Int32,
    #[serde(rename = "float32_vector")]
    Float32Vector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// How a partition file can be searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexType {
    /// Too small for anything but a scan.
    None,
    /// Large enough to be worth scanning as a flat index, but no IVF-PQ blob.
    Flat,
    IvfPq,
}

/// JSON metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub schema: Vec<ColumnSchema>,
    pub version: u32,
    pub row_count: usize,
    pub created_at: String,
    pub updated_at: String,
    pub model: EmbeddingModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub embedding_dimension: usize,
    pub index_type: IndexType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_config: Option<IndexConfig>,
}

impl FileMetadata {
    /// Metadata for a freshly written file with no index.
    pub fn new(model: EmbeddingModel, embedding_dimension: usize, row_count: usize) -> Self {
        let now = now_timestamp();
        Self {
            schema: Column::ALL
                .iter()
                .map(|c| ColumnSchema {
                    name: c.name().to_string(),
                    column_type: c.column_type(),
                })
                .collect(),
            version: FORMAT_VERSION,
            row_count,
            created_at: now.clone(),
            updated_at: now,
            model,
            partition_key: None,
            embedding_dimension,
            index_type: IndexType::None,
            index_config: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fixed 16-byte file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub metadata_len: u32,
    pub flags: u32,
}

impl FileHeader {
    pub fn has_index(&self) -> bool {
        self.flags & FLAG_HAS_INDEX != 0
    }

    /// Parse the header. The magic is checked before anything else.
    pub fn from_bytes(data: &[u8]) -> StorageResult<Self> {
        if data.len() < FILE_MAGIC.len() {
            return Err(StorageError::format("file shorter than magic bytes"));
        }
        if &data[..4] != FILE_MAGIC {
            return Err(StorageError::InvalidMagic);
        }
        if data.len() < HEADER_SIZE {
            return Err(StorageError::format("header truncated"));
        }

        let version = codec::read_u32(data, 4);
        if version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            metadata_len: codec::read_u32(data, 8),
            flags: codec::read_u32(data, 12),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(FILE_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.metadata_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }
}

/// Absolute offsets of the metadata block and each column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub metadata_offset: u64,
    pub column_offsets: [u64; 8],
}

impl Footer {
    pub fn column_offset(&self, column: Column) -> u64 {
        self.column_offsets[column.position()]
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        let all = std::iter::once(self.metadata_offset).chain(self.column_offsets);
        for (slot, offset) in buf.chunks_exact_mut(8).zip(all) {
            slot.copy_from_slice(&(offset as f64).to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> StorageResult<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(StorageError::format("footer truncated"));
        }
        let mut offsets = [0u64; 9];
        for (slot, chunk) in offsets.iter_mut().zip(data.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            let value = f64::from_le_bytes(raw);
            if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
                return Err(StorageError::format(format!("bad footer offset {}", value)));
            }
            *slot = value as u64;
        }

        let mut column_offsets = [0u64; 8];
        column_offsets.copy_from_slice(&offsets[1..]);
        Ok(Self {
            metadata_offset: offsets[0],
            column_offsets,
        })
    }
}

/// Appends sections to a byte buffer while tracking the absolute cursor.
struct SectionWriter {
    buf: Vec<u8>,
    cursor: u64,
}

impl SectionWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            cursor: 0,
        }
    }

    /// Append one section and return the offset it starts at.
    fn append(&mut self, section: &[u8]) -> u64 {
        let start = self.cursor;
        self.buf.extend_from_slice(section);
        self.cursor += section.len() as u64;
        start
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Serialize a whole partition file.
///
/// `metadata.row_count` and `metadata.embedding_dimension` must describe
/// `records`; every record must carry `metadata.model`.
pub fn serialize(
    records: &[EmbeddingRecord],
    metadata: &FileMetadata,
    index: Option<&IndexBlob>,
) -> StorageResult<Vec<u8>> {
    if metadata.row_count != records.len() {
        return Err(StorageError::format(format!(
            "metadata says {} rows, got {} records",
            metadata.row_count,
            records.len()
        )));
    }
    for r in records {
        if r.embedding.len() != metadata.embedding_dimension {
            return Err(StorageError::DimensionMismatch {
                expected: metadata.embedding_dimension,
                got: r.embedding.len(),
            });
        }
        if r.model != metadata.model {
            return Err(StorageError::format(format!(
                "record {} has model {}, file is {}",
                r.id, r.model, metadata.model
            )));
        }
    }

    let meta_json = serde_json::to_vec(metadata)?;
    let columns = encode_columns(records);
    let index_bytes = index.map(encode_index_blob).transpose()?;

    let header = FileHeader {
        version: FORMAT_VERSION,
        metadata_len: meta_json.len() as u32,
        flags: if index_bytes.is_some() { FLAG_HAS_INDEX } else { 0 },
    };

    let total = HEADER_SIZE
        + meta_json.len()
        + columns.iter().map(Vec::len).sum::<usize>()
        + index_bytes.as_ref().map_or(0, Vec::len)
        + FOOTER_SIZE;
    let mut out = SectionWriter::with_capacity(total);

    out.append(&header.to_bytes());
    let metadata_offset = out.append(&meta_json);
    let mut column_offsets = [0u64; 8];
    for (slot, bytes) in column_offsets.iter_mut().zip(&columns) {
        *slot = out.append(bytes);
    }
    if let Some(bytes) = &index_bytes {
        out.append(bytes);
    }
    let footer = Footer {
        metadata_offset,
        column_offsets,
    };
    out.append(&footer.to_bytes());

    Ok(out.finish())
}

fn encode_columns(records: &[EmbeddingRecord]) -> [Vec<u8>; 8] {
    let strings = |f: fn(&EmbeddingRecord) -> &str| {
        codec::encode_strings(&records.iter().map(f).collect::<Vec<_>>())
    };
    let chunk_indices: Vec<i32> = records.iter().map(|r| r.chunk_index).collect();
    let embeddings: Vec<&[f32]> = records.iter().map(|r| r.embedding.as_slice()).collect();

    [
        strings(|r| r.id.as_str()),
        strings(|r| r.title.as_str()),
        strings(|r| r.article_type.as_str()),
        codec::encode_i32s(&chunk_indices),
        strings(|r| r.text_preview.as_str()),
        codec::encode_vectors(&embeddings),
        strings(|r| r.model.as_str()),
        strings(|r| r.created_at.as_str()),
    ]
}

/// Decoded contents of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Strings(Vec<String>),
    Int32(Vec<i32>),
    Vectors(Vec<Vec<f32>>),
}

#[derive(Debug)]
enum Bytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Bytes::Mapped(m) => &m[..],
            Bytes::Owned(v) => &v[..],
        }
    }
}

/// A parsed partition file.
///
/// Opening parses the header, metadata and footer only; columns and the
/// index are decoded on demand from their footer offsets.
#[derive(Debug)]
pub struct PartitionFile {
    header: FileHeader,
    metadata: FileMetadata,
    footer: Footer,
    data: Bytes,
}

impl PartitionFile {
    /// Memory-map and parse a partition file.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(StorageError::format("empty file"));
        }
        // Safety: partition files are replaced by rename, never written in place.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(Bytes::Mapped(mmap))
    }

    pub fn from_bytes(data: Vec<u8>) -> StorageResult<Self> {
        Self::parse(Bytes::Owned(data))
    }

    fn parse(data: Bytes) -> StorageResult<Self> {
        let header = FileHeader::from_bytes(&data)?;

        let meta_end = HEADER_SIZE + header.metadata_len as usize;
        if data.len() < meta_end + FOOTER_SIZE {
            return Err(StorageError::format(format!(
                "file of {} bytes too short for {} bytes of metadata and footer",
                data.len(),
                header.metadata_len
            )));
        }
        let metadata: FileMetadata = serde_json::from_slice(&data[HEADER_SIZE..meta_end])
            .map_err(|e| StorageError::format(format!("metadata: {}", e)))?;

        let footer_start = data.len() - FOOTER_SIZE;
        let footer = Footer::from_bytes(&data[footer_start..])?;

        if footer.metadata_offset != HEADER_SIZE as u64
            || footer.column_offsets[0] != meta_end as u64
        {
            return Err(StorageError::format("footer does not match header"));
        }
        let mut previous = meta_end as u64;
        for &offset in &footer.column_offsets {
            if offset < previous || offset > footer_start as u64 {
                return Err(StorageError::format(format!(
                    "column offset {} outside {}..{}",
                    offset, previous, footer_start
                )));
            }
            previous = offset;
        }

        // every row owns at least its four chunk_index bytes
        let column_bytes = footer_start - meta_end;
        if metadata.row_count > column_bytes / 4 {
            return Err(StorageError::format(format!(
                "row count {} does not fit in {} bytes of columns",
                metadata.row_count, column_bytes
            )));
        }

        Ok(Self {
            header,
            metadata,
            footer,
            data,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn row_count(&self) -> usize {
        self.metadata.row_count
    }

    pub fn dimension(&self) -> usize {
        self.metadata.embedding_dimension
    }

    pub fn file_len(&self) -> usize {
        self.data.len()
    }

    fn footer_start(&self) -> usize {
        self.data.len() - FOOTER_SIZE
    }

    /// Byte range of one column, derived from the footer alone.
    ///
    /// The last column has no successor offset, so its end is read from its
    /// own string offset table.
    pub fn column_range(&self, column: Column) -> StorageResult<(usize, usize)> {
        let start = self.footer.column_offset(column) as usize;
        let limit = self.footer_start();
        let end = match Column::ALL.get(column.position() + 1) {
            Some(&next) => self.footer.column_offset(next) as usize,
            None => {
                let len = codec::string_column_len(&self.data[start..limit], self.row_count())?;
                start
                    .checked_add(len)
                    .ok_or_else(|| StorageError::format("column length overflows"))?
            }
        };
        if end > limit {
            return Err(StorageError::format(format!(
                "column {} runs past the footer",
                column.name()
            )));
        }
        Ok((start, end))
    }

    fn column_bytes(&self, column: Column) -> StorageResult<&[u8]> {
        let (start, end) = self.column_range(column)?;
        Ok(&self.data[start..end])
    }

    /// Decode a single column without touching the others.
    pub fn column(&self, column: Column) -> StorageResult<ColumnData> {
        let n = self.row_count();
        let bytes = self.column_bytes(column)?;
        Ok(match column.column_type() {
            ColumnType::Utf8 => ColumnData::Strings(codec::decode_strings(bytes, n)?),
            ColumnType::Int32 => ColumnData::Int32(codec::decode_i32s(bytes, n)?),
            ColumnType::Float32Vector => {
                ColumnData::Vectors(codec::decode_vectors(bytes, n, self.dimension())?)
            }
        })
    }

    pub fn strings(&self, column: Column) -> StorageResult<Vec<String>> {
        if column.column_type() != ColumnType::Utf8 {
            return Err(StorageError::format(format!(
                "{} is not a string column",
                column.name()
            )));
        }
        codec::decode_strings(self.column_bytes(column)?, self.row_count())
    }

    /// Embedding column as one row-major buffer.
    pub fn embeddings_flat(&self) -> StorageResult<Vec<f32>> {
        codec::decode_vectors_flat(
            self.column_bytes(Column::Embedding)?,
            self.row_count(),
            self.dimension(),
        )
    }

    /// Decode every column and rebuild the records.
    pub fn records(&self) -> StorageResult<Vec<EmbeddingRecord>> {
        let n = self.row_count();
        let ids = self.strings(Column::Id)?;
        let titles = self.strings(Column::Title)?;
        let types = self.strings(Column::Type)?;
        let chunk_indices = codec::decode_i32s(self.column_bytes(Column::ChunkIndex)?, n)?;
        let previews = self.strings(Column::TextPreview)?;
        let embeddings =
            codec::decode_vectors(self.column_bytes(Column::Embedding)?, n, self.dimension())?;
        let models = self.strings(Column::Model)?;
        let created = self.strings(Column::CreatedAt)?;

        let mut records = Vec::with_capacity(n);
        let columns = ids
            .into_iter()
            .zip(titles)
            .zip(types)
            .zip(chunk_indices)
            .zip(previews)
            .zip(embeddings)
            .zip(models)
            .zip(created);
        for (((((((id, title), ty), chunk_index), text_preview), embedding), model), created_at) in
            columns
        {
            let article_type: ArticleType = ty.parse().map_err(StorageError::Format)?;
            let model: EmbeddingModel = model.parse().map_err(StorageError::Format)?;
            records.push(EmbeddingRecord {
                id,
                title,
                article_type,
                chunk_index,
                text_preview,
                embedding,
                model,
                created_at,
            });
        }
        Ok(records)
    }

    /// Parse the IVF-PQ section, if the file has one.
    pub fn index(&self) -> StorageResult<Option<IndexBlob>> {
        if !self.header.has_index() {
            return Ok(None);
        }
        let (_, columns_end) = self.column_range(Column::CreatedAt)?;
        let blob = decode_index_blob(&self.data[columns_end..self.footer_start()])?;

        if blob.row_count() != self.row_count() || blob.config.dimension != self.dimension() {
            return Err(StorageError::format(format!(
                "index covers {} rows of dim {}, file has {} rows of dim {}",
                blob.row_count(),
                blob.config.dimension,
                self.row_count(),
                self.dimension()
            )));
        }
        Ok(Some(blob))
    }

    /// Nearest rows to `query`: approximate through the IVF-PQ section when
    /// present, exact scan otherwise.
    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> StorageResult<Vec<IndexHit>> {
        if query.len() != self.dimension() {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension(),
                got: query.len(),
            });
        }
        if let Some(blob) = self.index()? {
            return Ok(blob.search(query, k, nprobe)?);
        }

        let dim = self.dimension();
        let embeddings = self.embeddings_flat()?;
        let mut hits: Vec<IndexHit> = if dim == 0 {
            Vec::new()
        } else {
            embeddings
                .chunks_exact(dim)
                .enumerate()
                .map(|(row, v)| IndexHit {
                    row: row as u32,
                    distance: l2_distance_squared(query, v),
                })
                .collect()
        };
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.row.cmp(&b.row))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Union of `existing` and `incoming`, keyed by id.
///
/// Incoming records replace existing ones in place; new ids are appended in
/// arrival order. When an id repeats within one side, the later record wins.
pub fn merge_records(
    existing: Vec<EmbeddingRecord>,
    incoming: Vec<EmbeddingRecord>,
) -> Vec<EmbeddingRecord> {
    let mut merged: Vec<EmbeddingRecord> = Vec::with_capacity(existing.len() + incoming.len());
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(merged.capacity());

    for record in existing.into_iter().chain(incoming) {
        match positions.get(&record.id) {
            Some(&at) => merged[at] = record,
            None => {
                positions.insert(record.id.clone(), merged.len());
                merged.push(record);
            }
        }
    }
    merged
}
