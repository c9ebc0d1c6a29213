//! Core traits and types shared across attention implementations.
//!
//! Kernels operate on tensors with layout `[batch, heads, seq_len, head_dim]`.
//! Keys and values may carry fewer heads than queries (grouped-query
//! attention); query head `h` reads key/value head `h / (heads / kv_heads)`.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{
    AttentionConfig, AttentionPrecision, KernelConfig, RelativeAttentionConfig, RelativeRange,
};
pub use errors::{AttentionError, AttentionResult};

/// Tensors produced by one kernel call.
#[derive(Debug, Clone)]
pub struct AttentionProbs {
    /// Weighted sum of values, `[batch, heads, q_len, head_dim]`, input dtype.
    pub context: Tensor,
    /// Post-softmax weights, `[batch, heads, q_len, k_len]`. Fully masked rows are zero.
    pub weights: Tensor,
    /// Scaled and masked scores before the softmax, same shape as `weights`.
    pub scores: Tensor,
}

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, kv_heads, k_len, head_dim]` with `heads % kv_heads == 0`.
/// * `bias`, when present, is additive and broadcastable to
///   `[batch, heads, q_len, k_len]`; masked entries hold `-inf`.
/// * Scores are `q·kᵗ * config.scale + bias`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        config: &KernelConfig,
    ) -> AttentionResult<AttentionProbs>;
}
