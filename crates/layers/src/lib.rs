//! Building blocks for transformer layers.
//!
//! The crate hosts the projection machinery shared by attention and
//! feed-forward stacks: a [`Dense`](dense::Dense) layer whose execution path is
//! selected once from the weights present in a [`WeightStore`](store::WeightStore),
//! integer and 4-bit affine quantization kernels, tensor-parallel
//! communicators, and the normalisation/activation helpers applied around them.

pub mod activations;
pub mod checks;
pub mod dense;
pub mod dtypes;
pub mod norm;
pub mod parallel;
pub mod quantize;
pub mod store;

use thiserror::Error;

pub use dense::{Dense, DenseOptions, DenseWeights};
pub use parallel::{Communicator, LocalCommunicator, SingleRank};
pub use quantize::{QuantMethod, QuantizationConfig};
pub use store::{MemoryWeightStore, WeightStore};

/// Errors raised while binding or running layer components.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Illegal or unsupported combination of weight representations or options.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A required entry is absent from the weight store.
    #[error("missing weight `{0}`")]
    MissingWeight(String),
    /// Tensor dimensions do not line up with the bound weights.
    #[error("shape mismatch: {context}")]
    ShapeMismatch { context: String },
    /// A collective operation could not complete across the participating ranks.
    #[error("communication failure: {0}")]
    Communication(String),
    /// Failure reported by the tensor backend.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl LayerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }
}

/// Result alias used across the crate.
pub type LayerResult<T> = std::result::Result<T, LayerError>;
