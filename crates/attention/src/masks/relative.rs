//! Relative-position index matrices.
//!
//! Both builders return `u32` tensors `[q_len, k_len]` that index embedding or
//! bias tables. Query `i` is placed at key position `i + k_len - q_len`.

use candle_core::{Device, Result, Tensor};

use crate::core::RelativeRange;

fn distances(q_len: usize, k_len: usize) -> impl Iterator<Item = i64> {
    let offset = k_len as i64 - q_len as i64;
    (0..q_len as i64).flat_map(move |i| (0..k_len as i64).map(move |j| j - (i + offset)))
}

/// Clipped relative distances shifted to non-negative table indices.
///
/// Entry `(i, j)` is `clip(j - i, -m, m) + m` for [`RelativeRange::Symmetric`]
/// and `clip(j - i, -m, 0) + m` for [`RelativeRange::PastOnly`].
pub fn make_relative_positions(
    q_len: usize,
    k_len: usize,
    max_position: usize,
    range: RelativeRange,
    device: &Device,
) -> Result<Tensor> {
    let m = max_position as i64;
    let upper = match range {
        RelativeRange::Symmetric => m,
        RelativeRange::PastOnly => 0,
    };
    let data: Vec<u32> = distances(q_len, k_len)
        .map(|d| (d.clamp(-m, upper) + m) as u32)
        .collect();
    Tensor::from_vec(data, (q_len, k_len), device)
}

fn bucket(distance: i64, num_buckets: usize, max_distance: usize, bidirectional: bool) -> u32 {
    let mut buckets = num_buckets as i64;
    let mut index = 0i64;
    let magnitude = if bidirectional {
        buckets /= 2;
        if distance > 0 {
            index += buckets;
        }
        distance.abs()
    } else {
        (-distance).max(0)
    };

    let max_exact = buckets / 2;
    if magnitude < max_exact {
        return (index + magnitude) as u32;
    }
    let scaled = (magnitude as f64 / max_exact as f64).ln()
        / (max_distance as f64 / max_exact as f64).ln()
        * (buckets - max_exact) as f64;
    let large = (max_exact + scaled as i64).min(buckets - 1);
    (index + large) as u32
}

/// Log-spaced relative-position buckets for learned attention bias.
///
/// Distances below half the bucket range map one-to-one; longer ones share
/// logarithmically wider buckets up to `max_distance`. Bidirectional layouts
/// spend the upper half of the buckets on future keys, unidirectional ones
/// only distinguish past keys.
pub fn relative_position_buckets(
    q_len: usize,
    k_len: usize,
    num_buckets: usize,
    max_distance: usize,
    bidirectional: bool,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<u32> = distances(q_len, k_len)
        .map(|d| bucket(d, num_buckets, max_distance, bidirectional))
        .collect();
    Tensor::from_vec(data, (q_len, k_len), device)
}
