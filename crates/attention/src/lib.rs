//! Multi-head attention for transformer layers.
//!
//! Tensors inside the attention engine use the layout
//! `[batch, heads, seq_len, head_dim]`; layer inputs and outputs are
//! `[batch, seq_len, d_model]`. Keys and values may carry fewer heads than
//! queries (grouped-query and multi-query attention).
//!
//! * [`MultiHeadAttention`] binds `linear_0..linear_3` from a weight store and
//!   runs projections, positional variants, masking, caching and the
//!   tensor-parallel reduction.
//! * [`ExactAttention`] is the scaled dot-product kernel behind it. Scores are
//!   `q·kᵗ * scale + bias`; rows whose keys are all masked yield zero weights.
//! * [`KvCache`] is owned by the caller and passed by `&mut` to every decoding
//!   step.
//! * [`masks`] builds the additive causal, sliding-window and padding masks and
//!   the relative-position index matrices.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod multi_head;
pub mod positional;
pub mod reference;

pub use core::{
    Attention, AttentionConfig, AttentionError, AttentionPrecision, AttentionProbs,
    AttentionResult, KernelConfig, RelativeAttentionConfig, RelativeRange,
};
pub use kv_cache::{CacheStats, KvCache};
pub use multi_head::{AttentionInputs, AttentionOutput, MultiHeadAttention};
pub use positional::{PositionalEncoding, PositionalVariant};
pub use reference::ExactAttention;
