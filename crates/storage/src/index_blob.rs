//! Byte layout of the optional IVF-PQ section of a partition file.
//!
//! ```text
//! 7 x u32 LE section lengths (bytes), then the sections in order:
//!   config             UTF-8 JSON (IndexConfig)
//!   centroids          f32 LE [num_partitions * dim]
//!   codebooks          f32 LE [num_sub_quantizers * 256 * sub_dim]
//!   assignments        u32 LE [rows]
//!   pq_codes           u8     [rows * num_sub_quantizers]
//!   partition_offsets  u32 LE [num_partitions + 1]
//!   sorted_ids         u32 LE [rows]
//! ```

use crate::codec::{read_f32s, read_u32, read_u32s};
use crate::error::{StorageError, StorageResult};
use wikivec_index::{IndexBlob, IndexConfig};

/// Size of the section-length header.
pub const INDEX_HEADER_SIZE: usize = 7 * 4;

pub fn encode_index_blob(blob: &IndexBlob) -> StorageResult<Vec<u8>> {
    let config = serde_json::to_vec(&blob.config)?;
    let lengths = [
        config.len(),
        blob.centroids.len() * 4,
        blob.codebooks.len() * 4,
        blob.assignments.len() * 4,
        blob.pq_codes.len(),
        blob.partition_offsets.len() * 4,
        blob.sorted_ids.len() * 4,
    ];

    let mut buf = Vec::with_capacity(INDEX_HEADER_SIZE + lengths.iter().sum::<usize>());
    for len in lengths {
        buf.extend_from_slice(&(len as u32).to_le_bytes());
    }
    buf.extend_from_slice(&config);
    for v in blob.centroids.iter().chain(&blob.codebooks) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    for v in &blob.assignments {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf.extend_from_slice(&blob.pq_codes);
    for v in blob.partition_offsets.iter().chain(&blob.sorted_ids) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    Ok(buf)
}

/// Parse an index section occupying exactly `data`.
pub fn decode_index_blob(data: &[u8]) -> StorageResult<IndexBlob> {
    if data.len() < INDEX_HEADER_SIZE {
        return Err(StorageError::format("index header truncated"));
    }
    let lengths: Vec<usize> = (0..7).map(|i| read_u32(data, i * 4) as usize).collect();
    let total: usize = INDEX_HEADER_SIZE + lengths.iter().sum::<usize>();
    if total != data.len() {
        return Err(StorageError::format(format!(
            "index sections span {} bytes, index region is {}",
            total,
            data.len()
        )));
    }
    let word_aligned = [1, 2, 3, 5, 6];
    if word_aligned.iter().any(|&i| lengths[i] % 4 != 0) {
        return Err(StorageError::format("index section length not a multiple of 4"));
    }

    let mut cursor = INDEX_HEADER_SIZE;
    let mut sections = Vec::with_capacity(7);
    for len in &lengths {
        sections.push(&data[cursor..cursor + len]);
        cursor += len;
    }

    let config: IndexConfig = serde_json::from_slice(sections[0])
        .map_err(|e| StorageError::format(format!("index config: {}", e)))?;

    let blob = IndexBlob {
        config,
        centroids: read_f32s(sections[1]),
        codebooks: read_f32s(sections[2]),
        assignments: read_u32s(sections[3]),
        pq_codes: sections[4].to_vec(),
        partition_offsets: read_u32s(sections[5]),
        sorted_ids: read_u32s(sections[6]),
    };
    blob.validate()?;
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use wikivec_index::{IvfPqBuilder, IvfPqConfig};

    fn sample_blob() -> IndexBlob {
        let mut rng = StdRng::seed_from_u64(21);
        let vectors: Vec<f32> = (0..120 * 8).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let config = IvfPqConfig {
            num_partitions: 4,
            num_sub_quantizers: 2,
            ivf_iterations: 3,
            pq_iterations: 2,
            max_training_samples: None,
        };
        IvfPqBuilder::new(config).build(&vectors, 8, &mut rng).unwrap()
    }

    #[test]
    fn test_section_lengths_header() {
        let blob = sample_blob();
        let bytes = encode_index_blob(&blob).unwrap();

        let centroid_bytes = read_u32(&bytes, 4) as usize;
        let pq_code_bytes = read_u32(&bytes, 16) as usize;
        assert_eq!(centroid_bytes, 4 * 8 * 4);
        assert_eq!(pq_code_bytes, 120 * 2);
        assert_eq!(decode_index_blob(&bytes).unwrap(), blob);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_index_blob(&sample_blob()).unwrap();
        bytes.push(0);
        assert!(decode_index_blob(&bytes).unwrap_err().is_format_error());
    }

    #[test]
    fn test_inconsistent_blob_rejected() {
        let mut blob = sample_blob();
        blob.pq_codes.pop();
        let bytes = encode_index_blob(&blob).unwrap();
        assert!(decode_index_blob(&bytes).unwrap_err().is_format_error());
    }
}
