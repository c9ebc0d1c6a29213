//! Mask and relative-position utilities shared by attention implementations.
//!
//! Additive masks produced here have dtype `f32` and the layout
//! `[batch, num_heads, q_len, k_len]`. Values are either `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard). Queries are aligned with the most recent
//! keys: when `k_len > q_len`, query `i` sits at key position
//! `i + k_len - q_len`.

pub mod causal;
pub mod padding;
pub mod relative;
pub mod sliding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use padding::{length_mask_to_additive, padding_mask_from_booleans, prepare_length_mask};
pub use relative::{make_relative_positions, relative_position_buckets};
pub use sliding::build_sliding_window_mask;
