//! Product Quantization codebooks.
//!
//! The embedding dimension is split into `M` equal contiguous blocks. Each
//! block gets its own codebook of [`CODEBOOK_SIZE`] codewords, trained
//! independently with [`kmeans`](crate::kmeans::kmeans), so every vector
//! compresses to `M` bytes.

use crate::error::{IndexError, IndexResult};
use crate::kmeans::{kmeans, nearest_centroid};
use rand::Rng;
use wikivec_core::l2_distance_squared;

/// Codewords per sub-quantizer; one code fits in a `u8`.
pub const CODEBOOK_SIZE: usize = 256;

/// A trained Product Quantization codebook.
///
/// Centroids are stored as `[M][256][sub_dim]`, flattened:
/// `centroids[(m * 256 + k) * sub_dim + d]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PqCodebook {
    pub num_sub_quantizers: usize,
    pub sub_dim: usize,
    pub centroids: Vec<f32>,
}

impl PqCodebook {
    /// Check that `dim` splits evenly into `num_sub_quantizers` blocks.
    pub fn check_dimensions(dim: usize, num_sub_quantizers: usize) -> IndexResult<usize> {
        if num_sub_quantizers == 0 || dim == 0 || dim % num_sub_quantizers != 0 {
            return Err(IndexError::Precondition {
                dim,
                sub_quantizers: num_sub_quantizers,
            });
        }
        Ok(dim / num_sub_quantizers)
    }

    /// Train one codebook per sub-space over a row-major residual buffer.
    pub fn train<R: Rng + ?Sized>(
        residuals: &[f32],
        dim: usize,
        num_sub_quantizers: usize,
        iterations: usize,
        rng: &mut R,
    ) -> IndexResult<Self> {
        let sub_dim = Self::check_dimensions(dim, num_sub_quantizers)?;
        let n = residuals.len() / dim;

        let mut centroids = Vec::with_capacity(num_sub_quantizers * CODEBOOK_SIZE * sub_dim);
        let mut slice = Vec::with_capacity(n * sub_dim);

        for m in 0..num_sub_quantizers {
            slice.clear();
            for row in residuals.chunks_exact(dim) {
                slice.extend_from_slice(&row[m * sub_dim..(m + 1) * sub_dim]);
            }

            let trained = kmeans(&slice, sub_dim, CODEBOOK_SIZE, iterations, rng)?;
            centroids.extend_from_slice(&trained.centroids);
        }

        Ok(Self {
            num_sub_quantizers,
            sub_dim,
            centroids,
        })
    }

    /// Rebuild a codebook from its flat centroid buffer.
    pub fn from_parts(
        num_sub_quantizers: usize,
        sub_dim: usize,
        centroids: Vec<f32>,
    ) -> IndexResult<Self> {
        let expected = num_sub_quantizers * CODEBOOK_SIZE * sub_dim;
        if centroids.len() != expected {
            return Err(IndexError::Corrupt(format!(
                "codebook holds {} floats, expected {}",
                centroids.len(),
                expected
            )));
        }
        Ok(Self {
            num_sub_quantizers,
            sub_dim,
            centroids,
        })
    }

    pub fn dim(&self) -> usize {
        self.num_sub_quantizers * self.sub_dim
    }

    /// All codewords of sub-quantizer `m`.
    #[inline]
    pub fn sub_codebook(&self, m: usize) -> &[f32] {
        let size = CODEBOOK_SIZE * self.sub_dim;
        &self.centroids[m * size..(m + 1) * size]
    }

    #[inline]
    pub fn codeword(&self, m: usize, code: u8) -> &[f32] {
        let start = (m * CODEBOOK_SIZE + code as usize) * self.sub_dim;
        &self.centroids[start..start + self.sub_dim]
    }

    /// Encode one residual into `out` (one byte per sub-quantizer).
    pub fn encode_into(&self, residual: &[f32], out: &mut [u8]) {
        debug_assert_eq!(residual.len(), self.dim());
        debug_assert_eq!(out.len(), self.num_sub_quantizers);

        for (m, code) in out.iter_mut().enumerate() {
            let sub = &residual[m * self.sub_dim..(m + 1) * self.sub_dim];
            *code = nearest_centroid(sub, self.sub_codebook(m), self.sub_dim).0 as u8;
        }
    }

    pub fn encode(&self, residual: &[f32]) -> Vec<u8> {
        let mut codes = vec![0u8; self.num_sub_quantizers];
        self.encode_into(residual, &mut codes);
        codes
    }

    /// Approximate reconstruction of an encoded residual.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim());
        for (m, &code) in codes.iter().enumerate() {
            out.extend_from_slice(self.codeword(m, code));
        }
        out
    }

    /// ADC lookup table: squared distance from each query sub-vector to every
    /// codeword, laid out `[M][256]`.
    pub fn distance_table(&self, query_residual: &[f32]) -> Vec<f32> {
        let mut table = Vec::with_capacity(self.num_sub_quantizers * CODEBOOK_SIZE);
        for m in 0..self.num_sub_quantizers {
            let sub = &query_residual[m * self.sub_dim..(m + 1) * self.sub_dim];
            table.extend(
                self.sub_codebook(m)
                    .chunks_exact(self.sub_dim)
                    .map(|c| l2_distance_squared(sub, c)),
            );
        }
        table
    }
}

/// Sum the table entries selected by `codes`.
#[inline]
pub fn adc_distance(table: &[f32], codes: &[u8]) -> f32 {
    codes
        .iter()
        .enumerate()
        .map(|(m, &c)| table[m * CODEBOOK_SIZE + c as usize])
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_rows(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_check_dimensions() {
        assert_eq!(PqCodebook::check_dimensions(384, 16).unwrap(), 24);
        assert!(matches!(
            PqCodebook::check_dimensions(100, 16),
            Err(IndexError::Precondition { dim: 100, sub_quantizers: 16 })
        ));
        assert!(PqCodebook::check_dimensions(16, 0).is_err());
    }

    #[test]
    fn test_train_shape() {
        let rows = random_rows(300, 8, 1);
        let mut rng = StdRng::seed_from_u64(9);
        let codebook = PqCodebook::train(&rows, 8, 4, 4, &mut rng).unwrap();

        assert_eq!(codebook.num_sub_quantizers, 4);
        assert_eq!(codebook.sub_dim, 2);
        assert_eq!(codebook.centroids.len(), 4 * CODEBOOK_SIZE * 2);
    }

    #[test]
    fn test_encode_exact_codeword() {
        // with more codewords than points every point is its own codeword
        let rows = random_rows(40, 4, 2);
        let mut rng = StdRng::seed_from_u64(5);
        let codebook = PqCodebook::train(&rows, 4, 2, 3, &mut rng).unwrap();

        for row in rows.chunks_exact(4) {
            let codes = codebook.encode(row);
            let decoded = codebook.decode(&codes);
            assert!(l2_distance_squared(row, &decoded) < 1e-10);
        }
    }

    #[test]
    fn test_adc_matches_reconstruction_distance() {
        let rows = random_rows(500, 8, 3);
        let mut rng = StdRng::seed_from_u64(11);
        let codebook = PqCodebook::train(&rows, 8, 4, 5, &mut rng).unwrap();

        let query = &rows[..8];
        let table = codebook.distance_table(query);
        let codes = codebook.encode(&rows[8..16]);

        let via_table = adc_distance(&table, &codes);
        let via_decode = l2_distance_squared(query, &codebook.decode(&codes));
        assert!((via_table - via_decode).abs() < 1e-4);
    }

    #[test]
    fn test_from_parts_rejects_wrong_length() {
        assert!(PqCodebook::from_parts(2, 4, vec![0.0; 10]).is_err());
        assert!(PqCodebook::from_parts(2, 4, vec![0.0; 2 * 256 * 4]).is_ok());
    }
}
