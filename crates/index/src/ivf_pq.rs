//! IVF + PQ (Product Quantization) index construction.
//!
//! This module combines:
//! - IVF for coarse partitioning of the embedding space
//! - PQ over residuals (`vector - assigned centroid`) for compact codes
//!
//! The index is rebuilt from scratch whenever a partition file is
//! rewritten; there is no incremental update path.

use crate::error::{IndexError, IndexResult};
use crate::kmeans::{kmeans, nearest_centroid};
use crate::pq::{adc_distance, PqCodebook, CODEBOOK_SIZE};
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use wikivec_core::residual_into;

/// Tunables for IVF-PQ construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IvfPqConfig {
    /// Upper bound on IVF partitions; see [`effective_partitions`].
    pub num_partitions: usize,

    /// PQ sub-quantizers. The dimension must be divisible by this.
    pub num_sub_quantizers: usize,

    /// K-means iterations for IVF centroids.
    pub ivf_iterations: usize,

    /// K-means iterations per PQ sub-codebook.
    pub pq_iterations: usize,

    /// Train on a random sample of at most this many vectors. None = all.
    pub max_training_samples: Option<usize>,
}

impl Default for IvfPqConfig {
    fn default() -> Self {
        Self {
            num_partitions: 256,
            num_sub_quantizers: 16,
            ivf_iterations: 10,
            pq_iterations: 10,
            max_training_samples: Some(10_000),
        }
    }
}

/// Partition count actually used for `n` vectors.
///
/// Capped at `n / 10` so small partitions files do not end up with a
/// centroid per handful of vectors; never below one.
pub fn effective_partitions(configured: usize, n: usize) -> usize {
    configured.min(n / 10).max(1)
}

/// Parameters a built index was produced with.
///
/// Stored both in the file metadata and at the head of the index blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    pub num_partitions: usize,
    pub num_sub_quantizers: usize,
    pub codebook_size: usize,
    pub dimension: usize,
    pub sub_dimension: usize,
    pub ivf_iterations: usize,
    pub pq_iterations: usize,
    pub training_samples: usize,
}

/// A fully built IVF-PQ index over the rows of one partition file.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBlob {
    pub config: IndexConfig,
    /// `num_partitions * dim` floats.
    pub centroids: Vec<f32>,
    /// `num_sub_quantizers * 256 * sub_dim` floats.
    pub codebooks: Vec<f32>,
    /// IVF partition of every row.
    pub assignments: Vec<u32>,
    /// `row_count * num_sub_quantizers` bytes, row-major.
    pub pq_codes: Vec<u8>,
    /// Prefix sums of partition sizes, `num_partitions + 1` entries starting at 0.
    pub partition_offsets: Vec<u32>,
    /// Row indices grouped contiguously by partition.
    pub sorted_ids: Vec<u32>,
}

/// One search hit: a row of the partition file and its approximate distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub row: u32,
    pub distance: f32,
}

impl IndexBlob {
    pub fn row_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn centroid(&self, p: usize) -> &[f32] {
        let dim = self.config.dimension;
        &self.centroids[p * dim..(p + 1) * dim]
    }

    /// Row indices that belong to partition `p`.
    pub fn partition(&self, p: usize) -> &[u32] {
        let start = self.partition_offsets[p] as usize;
        let end = self.partition_offsets[p + 1] as usize;
        &self.sorted_ids[start..end]
    }

    pub fn codes(&self, row: usize) -> &[u8] {
        let m = self.config.num_sub_quantizers;
        &self.pq_codes[row * m..(row + 1) * m]
    }

    pub fn codebook(&self) -> IndexResult<PqCodebook> {
        PqCodebook::from_parts(
            self.config.num_sub_quantizers,
            self.config.sub_dimension,
            self.codebooks.clone(),
        )
    }

    /// Check the structural invariants a reader relies on.
    pub fn validate(&self) -> IndexResult<()> {
        let c = &self.config;
        let n = self.assignments.len();
        let corrupt = |msg: String| Err(IndexError::Corrupt(msg));

        if c.num_partitions == 0 || c.dimension == 0 || c.num_sub_quantizers == 0 {
            return corrupt("zero-sized index parameters".into());
        }
        if c.codebook_size != CODEBOOK_SIZE
            || c.sub_dimension * c.num_sub_quantizers != c.dimension
        {
            return corrupt(format!("inconsistent index config {:?}", c));
        }
        if self.centroids.len() != c.num_partitions * c.dimension {
            return corrupt(format!("{} centroid floats", self.centroids.len()));
        }
        if self.codebooks.len() != c.num_sub_quantizers * CODEBOOK_SIZE * c.sub_dimension {
            return corrupt(format!("{} codebook floats", self.codebooks.len()));
        }
        if self.pq_codes.len() != n * c.num_sub_quantizers {
            return corrupt(format!(
                "{} PQ code bytes for {} rows x {} sub-quantizers",
                self.pq_codes.len(),
                n,
                c.num_sub_quantizers
            ));
        }
        if self.sorted_ids.len() != n
            || self.partition_offsets.len() != c.num_partitions + 1
            || self.partition_offsets.first() != Some(&0)
            || self.partition_offsets.last().map(|&v| v as usize) != Some(n)
            || self.partition_offsets.windows(2).any(|w| w[0] > w[1])
        {
            return corrupt("partition offsets do not cover the rows".into());
        }
        if self.assignments.iter().any(|&a| a as usize >= c.num_partitions)
            || self.sorted_ids.iter().any(|&r| r as usize >= n)
        {
            return corrupt("row or partition reference out of range".into());
        }
        Ok(())
    }

    /// Approximate k nearest rows to `query`, probing the `nprobe` closest partitions.
    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> IndexResult<Vec<IndexHit>> {
        let dim = self.config.dimension;
        if query.len() != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                got: query.len(),
            });
        }
        if k == 0 || self.row_count() == 0 {
            return Ok(Vec::new());
        }

        let codebook = self.codebook()?;
        let nprobe = nprobe.clamp(1, self.config.num_partitions);

        let mut probes: Vec<(usize, f32)> = self
            .centroids
            .chunks_exact(dim)
            .map(|c| wikivec_core::l2_distance_squared(query, c))
            .enumerate()
            .collect();
        probes.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut hits = Vec::new();
        let mut query_residual = vec![0.0f32; dim];
        for &(p, _) in probes.iter().take(nprobe) {
            let rows = self.partition(p);
            if rows.is_empty() {
                continue;
            }
            residual_into(query, self.centroid(p), &mut query_residual);
            let table = codebook.distance_table(&query_residual);
            hits.extend(rows.iter().map(|&row| IndexHit {
                row,
                distance: adc_distance(&table, self.codes(row as usize)),
            }));
        }

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

/// Builds [`IndexBlob`]s from a row-major embedding buffer.
#[derive(Debug, Clone, Default)]
pub struct IvfPqBuilder {
    config: IvfPqConfig,
}

impl IvfPqBuilder {
    pub fn new(config: IvfPqConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IvfPqConfig {
        &self.config
    }

    /// Build the index over `vectors` (`n * dim` floats).
    ///
    /// Fails with [`IndexError::Precondition`] when `dim` does not split into
    /// the configured number of sub-quantizers.
    pub fn build<R: Rng + ?Sized>(
        &self,
        vectors: &[f32],
        dim: usize,
        rng: &mut R,
    ) -> IndexResult<IndexBlob> {
        let m = self.config.num_sub_quantizers;
        let sub_dim = PqCodebook::check_dimensions(dim, m)?;
        if vectors.len() % dim != 0 {
            return Err(IndexError::InvalidParams(format!(
                "buffer of {} floats is not a multiple of dim {}",
                vectors.len(),
                dim
            )));
        }
        let n = vectors.len() / dim;
        if n == 0 {
            return Err(IndexError::InsufficientSamples { min: 1, got: 0 });
        }

        let num_partitions = effective_partitions(self.config.num_partitions, n);
        let sample = self.training_sample(n, rng);
        let training_samples = sample.as_ref().map_or(n, Vec::len);

        tracing::info!(
            "Building IVF-PQ index: {} vectors, dim {}, {} partitions (configured {}), {} sub-quantizers, {} training samples",
            n,
            dim,
            num_partitions,
            self.config.num_partitions,
            m,
            training_samples
        );

        // IVF centroids, trained on the sample when there is one
        let ivf_training = match &sample {
            Some(rows) => gather_rows(vectors, dim, rows),
            None => vectors.to_vec(),
        };
        let ivf = kmeans(
            &ivf_training,
            dim,
            num_partitions,
            self.config.ivf_iterations,
            rng,
        )?;
        drop(ivf_training);

        // every vector, not just the sample, is assigned
        let assignments: Vec<u32> = vectors
            .chunks_exact(dim)
            .map(|v| nearest_centroid(v, &ivf.centroids, dim).0 as u32)
            .collect();
        let (partition_offsets, sorted_ids) = group_by_partition(&assignments, num_partitions);

        let mut residuals = vec![0.0f32; n * dim];
        for ((v, &p), out) in vectors
            .chunks_exact(dim)
            .zip(&assignments)
            .zip(residuals.chunks_exact_mut(dim))
        {
            residual_into(v, ivf.centroid(p as usize), out);
        }

        let pq_training = match &sample {
            Some(rows) => gather_rows(&residuals, dim, rows),
            None => residuals.clone(),
        };
        let codebook = PqCodebook::train(&pq_training, dim, m, self.config.pq_iterations, rng)?;
        drop(pq_training);

        let mut pq_codes = vec![0u8; n * m];
        for (r, out) in residuals.chunks_exact(dim).zip(pq_codes.chunks_exact_mut(m)) {
            codebook.encode_into(r, out);
        }

        tracing::debug!(
            "IVF-PQ partition sizes: {:?}",
            partition_offsets.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>()
        );

        Ok(IndexBlob {
            config: IndexConfig {
                num_partitions,
                num_sub_quantizers: m,
                codebook_size: CODEBOOK_SIZE,
                dimension: dim,
                sub_dimension: sub_dim,
                ivf_iterations: self.config.ivf_iterations,
                pq_iterations: self.config.pq_iterations,
                training_samples,
            },
            centroids: ivf.centroids,
            codebooks: codebook.centroids,
            assignments,
            pq_codes,
            partition_offsets,
            sorted_ids,
        })
    }

    /// Sorted sample of row indices, or None when every row is used.
    fn training_sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Option<Vec<usize>> {
        match self.config.max_training_samples {
            Some(max) if max > 0 && max < n => {
                let mut rows = index::sample(rng, n, max).into_vec();
                rows.sort_unstable();
                Some(rows)
            }
            _ => None,
        }
    }
}

fn gather_rows(vectors: &[f32], dim: usize, rows: &[usize]) -> Vec<f32> {
    let mut out = Vec::with_capacity(rows.len() * dim);
    for &r in rows {
        out.extend_from_slice(&vectors[r * dim..(r + 1) * dim]);
    }
    out
}

/// Counting sort of row indices by partition.
///
/// Returns prefix-sum offsets (`num_partitions + 1` entries) and the row
/// indices grouped by partition, ascending within each partition.
fn group_by_partition(assignments: &[u32], num_partitions: usize) -> (Vec<u32>, Vec<u32>) {
    let mut offsets = vec![0u32; num_partitions + 1];
    for &p in assignments {
        offsets[p as usize + 1] += 1;
    }
    for p in 0..num_partitions {
        offsets[p + 1] += offsets[p];
    }

    let mut cursor = offsets.clone();
    let mut sorted = vec![0u32; assignments.len()];
    for (row, &p) in assignments.iter().enumerate() {
        let slot = &mut cursor[p as usize];
        sorted[*slot as usize] = row as u32;
        *slot += 1;
    }
    (offsets, sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn generate_test_vectors(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn small_config(num_partitions: usize, num_sub_quantizers: usize) -> IvfPqConfig {
        IvfPqConfig {
            num_partitions,
            num_sub_quantizers,
            ivf_iterations: 5,
            pq_iterations: 3,
            max_training_samples: None,
        }
    }

    fn assert_coverage(blob: &IndexBlob, n: usize) {
        let mut seen = vec![0u32; n];
        for &row in &blob.sorted_ids {
            seen[row as usize] += 1;
        }
        assert!(seen.iter().all(|&c| c == 1), "every row exactly once");
        assert_eq!(*blob.partition_offsets.last().unwrap() as usize, n);
        blob.validate().unwrap();
    }

    #[test]
    fn test_effective_partitions() {
        assert_eq!(effective_partitions(256, 50), 5);
        assert_eq!(effective_partitions(256, 100_000), 256);
        assert_eq!(effective_partitions(256, 7), 1);
    }

    #[test]
    fn test_small_dataset_clamps_partitions() {
        let vectors = generate_test_vectors(50, 8, 42);
        let builder = IvfPqBuilder::new(small_config(256, 4));

        let blob = builder
            .build(&vectors, 8, &mut StdRng::seed_from_u64(1))
            .unwrap();

        assert_eq!(blob.config.num_partitions, 5);
        assert_eq!(blob.partition_offsets.len(), 6);
        assert_eq!(blob.pq_codes.len(), 50 * 4);
        assert_coverage(&blob, 50);
    }

    #[test]
    fn test_partition_grouping_matches_assignments() {
        let vectors = generate_test_vectors(400, 16, 7);
        let builder = IvfPqBuilder::new(small_config(8, 4));
        let blob = builder
            .build(&vectors, 16, &mut StdRng::seed_from_u64(2))
            .unwrap();

        assert_coverage(&blob, 400);
        for p in 0..blob.config.num_partitions {
            for &row in blob.partition(p) {
                assert_eq!(blob.assignments[row as usize] as usize, p);
            }
        }
    }

    #[test]
    fn test_sampled_training_still_assigns_every_vector() {
        let vectors = generate_test_vectors(600, 8, 3);
        let config = IvfPqConfig {
            max_training_samples: Some(120),
            ..small_config(6, 2)
        };
        let blob = IvfPqBuilder::new(config)
            .build(&vectors, 8, &mut StdRng::seed_from_u64(4))
            .unwrap();

        assert_eq!(blob.config.training_samples, 120);
        assert_eq!(blob.assignments.len(), 600);
        assert_coverage(&blob, 600);
    }

    #[test]
    fn test_indivisible_dimension_is_precondition_error() {
        let vectors = generate_test_vectors(100, 10, 5);
        let result = IvfPqBuilder::new(small_config(4, 4)).build(
            &vectors,
            10,
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(
            result,
            Err(IndexError::Precondition { dim: 10, sub_quantizers: 4 })
        ));
    }

    #[test]
    fn test_deterministic_with_seed() {
        let vectors = generate_test_vectors(200, 8, 8);
        let builder = IvfPqBuilder::new(small_config(4, 2));
        let a = builder.build(&vectors, 8, &mut StdRng::seed_from_u64(99)).unwrap();
        let b = builder.build(&vectors, 8, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_search_finds_query_row() {
        let vectors = generate_test_vectors(300, 16, 123);
        let blob = IvfPqBuilder::new(small_config(5, 8))
            .build(&vectors, 16, &mut StdRng::seed_from_u64(6))
            .unwrap();

        let query = &vectors[42 * 16..43 * 16];
        let hits = blob.search(query, 5, blob.config.num_partitions).unwrap();

        assert_eq!(hits.len(), 5);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(hits.iter().any(|h| h.row == 42));
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let vectors = generate_test_vectors(100, 4, 1);
        let blob = IvfPqBuilder::new(small_config(2, 2))
            .build(&vectors, 4, &mut StdRng::seed_from_u64(6))
            .unwrap();
        assert!(blob.search(&[0.0; 3], 1, 1).is_err());
    }

    #[test]
    fn test_index_config_json_keys() {
        let vectors = generate_test_vectors(60, 4, 2);
        let blob = IvfPqBuilder::new(small_config(16, 2))
            .build(&vectors, 4, &mut StdRng::seed_from_u64(3))
            .unwrap();

        let json = serde_json::to_value(&blob.config).unwrap();
        assert_eq!(json["numPartitions"], 6);
        assert_eq!(json["codebookSize"], 256);
        assert_eq!(json["subDimension"], 2);
        assert_eq!(json["trainingSamples"], 60);
    }

    #[test]
    fn test_validate_rejects_bad_offsets() {
        let vectors = generate_test_vectors(100, 4, 1);
        let mut blob = IvfPqBuilder::new(small_config(2, 2))
            .build(&vectors, 4, &mut StdRng::seed_from_u64(6))
            .unwrap();
        *blob.partition_offsets.last_mut().unwrap() = 99;
        assert!(matches!(blob.validate(), Err(IndexError::Corrupt(_))));
    }
}
