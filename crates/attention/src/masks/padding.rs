//! Length-based and boolean padding masks.
//!
//! Length masks are built in two steps: [`prepare_length_mask`] turns per-batch
//! key lengths into the number of readable keys for every `(head, query)`, and
//! [`length_mask_to_additive`] expands those counts into an additive mask.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Number of readable keys for each batch entry, head and query.
///
/// `lengths` is an integer tensor `[batch]`. With `mask_future`, query `i` also
/// stops at key `past_len + i` (causal decoding over `past_len` cached keys).
///
/// The result is `u32` `[batch, num_heads, num_queries]`, or
/// `[batch, num_queries * num_heads]` with `multi_query`, where heads are
/// folded into the query axis time-major (index `i * num_heads + h`).
pub fn prepare_length_mask(
    lengths: &Tensor,
    num_heads: usize,
    num_queries: usize,
    mask_future: bool,
    multi_query: bool,
    past_len: usize,
) -> Result<Tensor> {
    if lengths.rank() != 1 {
        bail!("lengths must be a [batch] tensor, got {:?}", lengths.dims());
    }
    let host = lengths.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let batch = host.len();

    let count = |length: u32, query: usize| -> u32 {
        if mask_future {
            length.min((past_len + query + 1) as u32)
        } else {
            length
        }
    };

    let mut data = Vec::with_capacity(batch * num_heads * num_queries);
    for &length in &host {
        if multi_query {
            for q in 0..num_queries {
                data.extend(std::iter::repeat(count(length, q)).take(num_heads));
            }
        } else {
            for _ in 0..num_heads {
                data.extend((0..num_queries).map(|q| count(length, q)));
            }
        }
    }

    if multi_query {
        Tensor::from_vec(data, (batch, num_queries * num_heads), lengths.device())
    } else {
        Tensor::from_vec(data, (batch, num_heads, num_queries), lengths.device())
    }
}

/// Expands readable-key counts into an additive mask with a trailing `k_len`
/// axis: key `k` is kept when `k < count`.
pub fn length_mask_to_additive(counts: &Tensor, k_len: usize) -> Result<Tensor> {
    let host = counts
        .to_dtype(DType::U32)?
        .flatten_all()?
        .to_vec1::<u32>()?;
    let mut data = Vec::with_capacity(host.len() * k_len);
    for &count in &host {
        let count = (count as usize).min(k_len);
        data.extend(std::iter::repeat(0f32).take(count));
        data.extend(std::iter::repeat(f32::NEG_INFINITY).take(k_len - count));
    }
    let mut dims = counts.dims().to_vec();
    dims.push(k_len);
    Tensor::from_vec(data, dims, counts.device())
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(
    device: &Device,
    padding: &[Vec<bool>],
    num_heads: usize,
    q_len: usize,
) -> Result<Tensor> {
    let batch = padding.len();
    let k_len = padding.first().map(Vec::len).unwrap_or(0);
    if let Some(row) = padding.iter().find(|row| row.len() != k_len) {
        bail!(
            "all boolean padding masks must share k_len {k_len}, got {}",
            row.len()
        );
    }

    let rows: Vec<f32> = padding
        .iter()
        .flatten()
        .map(|&is_padding| if is_padding { f32::NEG_INFINITY } else { 0.0 })
        .collect();
    Tensor::from_vec(rows, (batch, 1, 1, k_len), device)?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}
