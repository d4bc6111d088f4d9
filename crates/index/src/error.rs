//! Index construction error types.

use thiserror::Error;

/// Errors raised while training or reading an ANN index.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Not enough training samples: need at least {min}, got {got}")]
    InsufficientSamples { min: usize, got: usize },

    #[error("Dimension {dim} is not divisible by {sub_quantizers} sub-quantizers")]
    Precondition { dim: usize, sub_quantizers: usize },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Corrupt index: {0}")]
    Corrupt(String),
}

pub type IndexResult<T> = Result<T, IndexError>;
