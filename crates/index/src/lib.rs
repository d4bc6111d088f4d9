//! Approximate nearest neighbour indexing for wikivec partitions.
//!
//! Implements:
//! - generic k-means with k-means++ seeding (shared by IVF and PQ training)
//! - Product Quantization codebooks with 256 codewords per sub-space
//! - IVF-PQ index construction over residuals, plus ADC search

pub mod error;
pub mod ivf_pq;
pub mod kmeans;
pub mod pq;

pub use error::{IndexError, IndexResult};
pub use ivf_pq::{effective_partitions, IndexBlob, IndexConfig, IndexHit, IvfPqBuilder, IvfPqConfig};
pub use kmeans::{kmeans, nearest_centroid, KMeansResult};
pub use pq::{PqCodebook, CODEBOOK_SIZE};
