//! K-means clustering with k-means++ initialization.
//!
//! The same routine trains IVF centroids over full embeddings and PQ
//! codebooks over sub-vector slices; callers differ only in `k` and in the
//! vector set they pass. Vectors are a flat row-major `f32` buffer with a
//! fixed stride of `dim`.
//!
//! Training runs a fixed number of iterations with no convergence check, so
//! build time is bounded by `n * k * dim * iterations`. A cluster that ends
//! an iteration empty keeps its previous centroid; it is not reseeded.

use crate::error::{IndexError, IndexResult};
use rand::Rng;
use rayon::prelude::*;
use wikivec_core::l2_distance_squared;

/// Result of k-means clustering.
#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// `k * dim` centroid values, row-major.
    pub centroids: Vec<f32>,
    /// Nearest centroid of every input vector, against the returned centroids.
    pub assignments: Vec<u32>,
    pub k: usize,
    pub dim: usize,
}

impl KMeansResult {
    #[inline]
    pub fn centroid(&self, c: usize) -> &[f32] {
        &self.centroids[c * self.dim..(c + 1) * self.dim]
    }

    /// Number of vectors assigned to each cluster.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.k];
        for &a in &self.assignments {
            sizes[a as usize] += 1;
        }
        sizes
    }
}

/// Cluster `vectors` into `k` groups.
///
/// `k` may exceed the number of distinct vectors; the surplus centroids are
/// then duplicates picked uniformly at random, which keeps the codebook
/// shape fixed for PQ.
pub fn kmeans<R: Rng + ?Sized>(
    vectors: &[f32],
    dim: usize,
    k: usize,
    iterations: usize,
    rng: &mut R,
) -> IndexResult<KMeansResult> {
    if dim == 0 || k == 0 {
        return Err(IndexError::InvalidParams(format!(
            "k-means needs dim > 0 and k > 0 (dim={}, k={})",
            dim, k
        )));
    }
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

    let mut centroids = kmeans_plusplus_init(vectors, dim, k, rng);

    for iter in 0..iterations {
        let assignments = assign(vectors, &centroids, dim);
        let emptied = update_centroids(vectors, &assignments, &mut centroids, dim, k);

        tracing::debug!(
            "K-means iteration {}/{}: k={}, n={}, {} empty clusters kept",
            iter + 1,
            iterations,
            k,
            n,
            emptied
        );
    }

    let assignments = assign(vectors, &centroids, dim);

    Ok(KMeansResult {
        centroids,
        assignments,
        k,
        dim,
    })
}

/// Index and squared distance of the centroid closest to `vector`.
///
/// Ties resolve to the lowest centroid index.
#[inline]
pub fn nearest_centroid(vector: &[f32], centroids: &[f32], dim: usize) -> (usize, f32) {
    let mut best_idx = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centroids.chunks_exact(dim).enumerate() {
        let dist = l2_distance_squared(vector, c);
        if dist < best_dist {
            best_dist = dist;
            best_idx = i;
        }
    }
    (best_idx, best_dist)
}

fn assign(vectors: &[f32], centroids: &[f32], dim: usize) -> Vec<u32> {
    vectors
        .par_chunks_exact(dim)
        .map(|v| nearest_centroid(v, centroids, dim).0 as u32)
        .collect()
}

/// Move every non-empty cluster to the mean of its members.
///
/// Returns the number of clusters that had no members.
fn update_centroids(
    vectors: &[f32],
    assignments: &[u32],
    centroids: &mut [f32],
    dim: usize,
    k: usize,
) -> usize {
    let mut sums = vec![0.0f64; k * dim];
    let mut counts = vec![0usize; k];

    for (v, &c) in vectors.chunks_exact(dim).zip(assignments) {
        let c = c as usize;
        counts[c] += 1;
        for (s, &x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(v) {
            *s += x as f64;
        }
    }

    let mut emptied = 0;
    for c in 0..k {
        if counts[c] == 0 {
            emptied += 1;
            continue;
        }
        let inv = 1.0 / counts[c] as f64;
        for (dst, &s) in centroids[c * dim..(c + 1) * dim]
            .iter_mut()
            .zip(&sums[c * dim..(c + 1) * dim])
        {
            *dst = (s * inv) as f32;
        }
    }
    emptied
}

/// K-means++ seeding: first centroid uniform, the rest by D² sampling.
fn kmeans_plusplus_init<R: Rng + ?Sized>(
    vectors: &[f32],
    dim: usize,
    k: usize,
    rng: &mut R,
) -> Vec<f32> {
    let n = vectors.len() / dim;
    let row = |i: usize| &vectors[i * dim..(i + 1) * dim];

    let mut centroids = Vec::with_capacity(k * dim);
    centroids.extend_from_slice(row(rng.gen_range(0..n)));

    let mut min_distances: Vec<f32> = vectors
        .par_chunks_exact(dim)
        .map(|v| l2_distance_squared(v, &centroids[..dim]))
        .collect();

    for _ in 1..k {
        let total: f64 = min_distances.iter().map(|&d| d as f64).sum();

        let chosen = if total <= 0.0 {
            // every point already coincides with a centroid
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumsum = 0.0f64;
            let mut chosen = None;
            let mut last_positive = 0;
            for (i, &d) in min_distances.iter().enumerate() {
                if d > 0.0 {
                    last_positive = i;
                }
                cumsum += d as f64;
                if cumsum >= threshold && d > 0.0 {
                    chosen = Some(i);
                    break;
                }
            }
            // rounding can leave the threshold just past the final sum
            chosen.unwrap_or(last_positive)
        };

        let start = centroids.len();
        centroids.extend_from_slice(row(chosen));
        let newest = &centroids[start..start + dim];

        min_distances
            .par_iter_mut()
            .zip(vectors.par_chunks_exact(dim))
            .for_each(|(best, v)| {
                let d = l2_distance_squared(v, newest);
                if d < *best {
                    *best = d;
                }
            });
    }

    centroids
}
