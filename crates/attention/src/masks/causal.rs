//! Causal attention masks.

use candle_core::{Device, Result, Tensor};

/// Masks every key that lies after its query.
///
/// With `k_len > q_len` the queries continue a cached prefix, so query `i` may
/// read keys `0..=i + k_len - q_len`.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let block: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| if k > q + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(block, (1, 1, q_len, k_len), device)?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}
