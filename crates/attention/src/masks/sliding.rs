//! Sliding-window attention masks.

use candle_core::{Device, Result, Tensor};

/// Masks keys that lie `window` or more positions behind their query.
///
/// Future keys are left untouched; combine with
/// [`build_causal_mask`](super::build_causal_mask) for decoder self-attention.
pub fn build_sliding_window_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
    window: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut row_block = vec![0f32; q_len * k_len];
    for q in 0..q_len {
        let position = q + offset;
        for k in 0..k_len.min(position + 1) {
            if position - k >= window {
                row_block[q * k_len + k] = f32::NEG_INFINITY;
            }
        }
    }
    let block = Tensor::from_vec(row_block, (1, 1, q_len, k_len), device)?;
    block.broadcast_as((batch, num_heads, q_len, k_len))?.contiguous()
}
