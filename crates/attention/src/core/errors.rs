//! Error types emitted by attention implementations.

use layers::LayerError;
use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// Illegal combination of options or weights.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("missing weight `{0}`")]
    MissingWeight(String),
    #[error("communication failure: {0}")]
    Communication(String),
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<LayerError> for AttentionError {
    fn from(err: LayerError) -> Self {
        match err {
            LayerError::Configuration(message) => Self::Configuration(message),
            LayerError::MissingWeight(name) => Self::MissingWeight(name),
            LayerError::ShapeMismatch { context } => Self::InvalidShape { context },
            LayerError::Communication(message) => Self::Communication(message),
            LayerError::Backend(err) => Self::Backend(err),
        }
    }
}

pub type AttentionResult<T> = std::result::Result<T, AttentionError>;
