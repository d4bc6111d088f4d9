//! Core record types and distance kernels for the wikivec embedding store.

pub mod distance;
pub mod types;

pub use distance::{l2_distance_squared, residual_into};
pub use types::{ArticleType, EmbeddingModel, EmbeddingRecord};
