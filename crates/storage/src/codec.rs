//! Column encodings.
//!
//! - strings: `N + 1` u32-LE offsets, then the concatenated UTF-8 bytes
//! - i32: 4-byte little-endian stride
//! - embeddings: contiguous row-major f32-LE, stride = dimension
//!
//! Encoders never validate; a broken offset table only surfaces as a
//! format error when the column is decoded.

use crate::error::{StorageError, StorageResult};

pub fn encode_strings<S: AsRef<str>>(values: &[S]) -> Vec<u8> {
    let data_len: usize = values.iter().map(|v| v.as_ref().len()).sum();
    let mut buf = Vec::with_capacity(4 * (values.len() + 1) + data_len);

    let mut offset = 0u32;
    buf.extend_from_slice(&offset.to_le_bytes());
    for v in values {
        offset += v.as_ref().len() as u32;
        buf.extend_from_slice(&offset.to_le_bytes());
    }
    for v in values {
        buf.extend_from_slice(v.as_ref().as_bytes());
    }
    buf
}

/// Total byte length of a string column holding `n` values at the start of `data`.
pub fn string_column_len(data: &[u8], n: usize) -> StorageResult<usize> {
    let table_len = offset_table_len(n)?;
    if data.len() < table_len {
        return Err(StorageError::format(format!(
            "string offset table needs {} bytes, {} available",
            table_len,
            data.len()
        )));
    }
    let total = read_u32(data, n * 4) as usize;
    table_len
        .checked_add(total)
        .ok_or_else(|| StorageError::format("string column length overflows"))
}

/// `4 * (n + 1)`, or a format error when `n` cannot describe a real column.
fn offset_table_len(n: usize) -> StorageResult<usize> {
    n.checked_add(1)
        .and_then(|entries| entries.checked_mul(4))
        .ok_or_else(|| StorageError::format(format!("string column of {} rows", n)))
}

pub fn decode_strings(data: &[u8], n: usize) -> StorageResult<Vec<String>> {
    let table_len = offset_table_len(n)?;
    if data.len() < table_len {
        return Err(StorageError::format(format!(
            "string offset table needs {} bytes, {} available",
            table_len,
            data.len()
        )));
    }
    let payload = &data[table_len..];

    let mut values = Vec::with_capacity(n);
    let mut start = read_u32(data, 0) as usize;
    if start != 0 {
        return Err(StorageError::format("string offset table does not start at 0"));
    }
    for i in 1..=n {
        let end = read_u32(data, i * 4) as usize;
        if end < start || end > payload.len() {
            return Err(StorageError::format(format!(
                "string offset {} out of order or out of bounds ({} after {}, payload {})",
                i,
                end,
                start,
                payload.len()
            )));
        }
        let s = std::str::from_utf8(&payload[start..end])
            .map_err(|e| StorageError::format(format!("string {} is not UTF-8: {}", i - 1, e)))?;
        values.push(s.to_owned());
        start = end;
    }
    Ok(values)
}

pub fn encode_i32s(values: &[i32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

pub fn decode_i32s(data: &[u8], n: usize) -> StorageResult<Vec<i32>> {
    let len = n
        .checked_mul(4)
        .ok_or_else(|| StorageError::format(format!("int32 column of {} rows", n)))?;
    if data.len() < len {
        return Err(StorageError::format(format!(
            "int32 column of {} rows truncated to {} bytes",
            n,
            data.len()
        )));
    }
    Ok(data[..len]
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Byte length of an embedding column, None if it does not fit in `usize`.
pub fn vectors_len(n: usize, dim: usize) -> Option<usize> {
    n.checked_mul(dim)?.checked_mul(4)
}

pub fn encode_vectors<V: AsRef<[f32]>>(rows: &[V]) -> Vec<u8> {
    let floats: usize = rows.iter().map(|r| r.as_ref().len()).sum();
    let mut buf = Vec::with_capacity(floats * 4);
    for row in rows {
        for v in row.as_ref() {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf
}

/// Decode `n * dim` floats into one flat row-major buffer.
pub fn decode_vectors_flat(data: &[u8], n: usize, dim: usize) -> StorageResult<Vec<f32>> {
    let len = vectors_len(n, dim).ok_or_else(|| {
        StorageError::format(format!("embedding column of {}x{} overflows", n, dim))
    })?;
    if data.len() < len {
        return Err(StorageError::format(format!(
            "embedding column of {}x{} truncated to {} bytes",
            n,
            dim,
            data.len()
        )));
    }
    Ok(read_f32s(&data[..len]))
}

pub fn decode_vectors(data: &[u8], n: usize, dim: usize) -> StorageResult<Vec<Vec<f32>>> {
    let flat = decode_vectors_flat(data, n, dim)?;
    if dim == 0 {
        return Ok(vec![Vec::new(); n]);
    }
    Ok(flat.chunks_exact(dim).map(<[f32]>::to_vec).collect())
}

pub(crate) fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub(crate) fn read_f32s(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub(crate) fn read_u32s(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_layout() {
        let bytes = encode_strings(&["ab", "", "çé"]);

        // offsets 0, 2, 2, 6 then payload
        assert_eq!(&bytes[..16], &[0, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0, 6, 0, 0, 0]);
        assert_eq!(string_column_len(&bytes, 3).unwrap(), bytes.len());
        assert_eq!(decode_strings(&bytes, 3).unwrap(), vec!["ab", "", "çé"]);
    }

    #[test]
    fn test_empty_string_column() {
        let bytes = encode_strings::<&str>(&[]);
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert!(decode_strings(&bytes, 0).unwrap().is_empty());
    }

    #[test]
    fn test_non_monotonic_offsets_fail_on_decode() {
        let mut bytes = encode_strings(&["abc", "de"]);
        // offsets 0, 5, 2
        bytes[4..8].copy_from_slice(&5u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&2u32.to_le_bytes());

        let err = decode_strings(&bytes, 2).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_offset_past_payload_fails() {
        let mut bytes = encode_strings(&["abc"]);
        bytes[4..8].copy_from_slice(&40u32.to_le_bytes());
        assert!(decode_strings(&bytes, 1).unwrap_err().is_format_error());
    }

    #[test]
    fn test_truncated_table_fails() {
        assert!(decode_strings(&[0, 0, 0], 0).is_err());
        assert!(string_column_len(&[0; 7], 1).is_err());
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let mut bytes = encode_strings(&["ok"]);
        let last = bytes.len() - 1;
        bytes[last] = 0xff;
        assert!(decode_strings(&bytes, 1).unwrap_err().is_format_error());
    }

    #[test]
    fn test_absurd_row_counts_are_format_errors() {
        let bytes = encode_strings(&["a"]);
        let huge = usize::MAX / 2;

        assert!(decode_strings(&bytes, huge).unwrap_err().is_format_error());
        assert!(decode_strings(&bytes, usize::MAX).unwrap_err().is_format_error());
        assert!(string_column_len(&bytes, usize::MAX).unwrap_err().is_format_error());
        assert!(decode_i32s(&bytes, huge).unwrap_err().is_format_error());
        assert!(decode_vectors(&bytes, huge, 384).unwrap_err().is_format_error());
        assert_eq!(vectors_len(huge, 384), None);
    }

    #[test]
    fn test_i32_column() {
        let values = [0, -1, i32::MAX, 7];
        let bytes = encode_i32s(&values);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_i32s(&bytes, 4).unwrap(), values);
        assert!(decode_i32s(&bytes[..15], 4).is_err());
    }

    #[test]
    fn test_vector_column_row_major() {
        let rows = vec![vec![1.0f32, 2.0], vec![-0.5, f32::MIN_POSITIVE]];
        let bytes = encode_vectors(&rows);

        assert_eq!(Some(bytes.len()), vectors_len(2, 2));
        assert_eq!(&bytes[4..8], &2.0f32.to_le_bytes());
        assert_eq!(decode_vectors(&bytes, 2, 2).unwrap(), rows);
        assert_eq!(
            decode_vectors_flat(&bytes, 2, 2).unwrap(),
            vec![1.0, 2.0, -0.5, f32::MIN_POSITIVE]
        );
        assert!(decode_vectors(&bytes, 3, 2).is_err());
    }
}
