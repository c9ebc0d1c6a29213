//! Attention with Linear Biases.
//!
//! The bias table is `[heads, 1, positions]`. Head `h` (1-based) of `n` heads
//! has slope `2^(-8h/n)` when `n` is a power of two; other head counts take the
//! slopes of the closest lower power of two followed by every other slope of
//! the next power of two.
//!
//! By default key `k` of `K` keys receives `slope * (k - (K - 1))`, the
//! negative distance to the last key. Softmax is shift invariant per row, so
//! this equals the usual `-slope * (q - k)` for the query aligned with the last
//! key. With `use_positive_positions` the bias is `slope * k` instead.

use std::sync::Mutex;

use candle_core::{bail, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

use super::rope::DEFAULT_INITIAL_POSITIONS;

fn power_of_two_slopes(n: usize) -> impl Iterator<Item = f32> {
    (1..=n).map(move |h| 2f32.powf(-8.0 * h as f32 / n as f32))
}

/// Per-head ALiBi slopes.
pub fn alibi_slopes(num_heads: usize) -> Vec<f32> {
    if num_heads == 0 {
        return Vec::new();
    }
    let closest = if num_heads.is_power_of_two() {
        num_heads
    } else {
        num_heads.next_power_of_two() / 2
    };
    let mut slopes: Vec<f32> = power_of_two_slopes(closest).collect();
    slopes.extend(
        power_of_two_slopes(2 * closest)
            .step_by(2)
            .take(num_heads - closest),
    );
    slopes
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlibiConfig {
    pub use_positive_positions: bool,
    /// Pre-multiply the bias by the query scale used for the dot product.
    pub scale_alibi: bool,
    pub num_initial_positions: usize,
}

impl Default for AlibiConfig {
    fn default() -> Self {
        Self {
            use_positive_positions: false,
            scale_alibi: false,
            num_initial_positions: DEFAULT_INITIAL_POSITIONS,
        }
    }
}

#[derive(Debug)]
struct AlibiTable {
    bias: Tensor,
    num_heads: usize,
    positions: usize,
    device: Device,
}

/// Shared ALiBi provider. One instance is usually shared by every layer of a
/// model, so the table lives behind a mutex.
#[derive(Debug)]
pub struct Alibi {
    config: AlibiConfig,
    table: Mutex<Option<AlibiTable>>,
}

impl Alibi {
    pub fn new(config: AlibiConfig) -> Self {
        Self {
            config,
            table: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AlibiConfig {
        &self.config
    }

    /// Number of key positions currently covered.
    pub fn positions(&self) -> usize {
        self.table
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|t| t.positions))
            .unwrap_or(0)
    }

    fn build(&self, num_heads: usize, positions: usize, device: &Device) -> Result<Tensor> {
        let slopes = alibi_slopes(num_heads);
        let last = positions as f32 - 1.0;
        let mut data = Vec::with_capacity(num_heads * positions);
        for slope in slopes {
            for k in 0..positions {
                let distance = if self.config.use_positive_positions {
                    k as f32
                } else {
                    k as f32 - last
                };
                data.push(slope * distance);
            }
        }
        Tensor::from_vec(data, (num_heads, 1, positions), device)
    }

    /// Bias for `key_len` keys, shaped `[total_heads, 1, key_len]`.
    pub fn bias(&self, total_heads: usize, key_len: usize, device: &Device) -> Result<Tensor> {
        let mut guard = match self.table.lock() {
            Ok(guard) => guard,
            Err(_) => bail!("alibi table lock poisoned"),
        };
        let current = match guard.as_ref() {
            Some(t) if t.num_heads == total_heads && t.device.same_device(device) => t.positions,
            _ => 0,
        };
        if key_len > current {
            let positions = key_len.max(current + self.config.num_initial_positions);
            let bias = self.build(total_heads, positions, device)?;
            log::debug!("alibi table grown from {current} to {positions} positions ({total_heads} heads)");
            *guard = Some(AlibiTable {
                bias,
                num_heads: total_heads,
                positions,
                device: device.clone(),
            });
        }
        let Some(table) = guard.as_ref() else {
            bail!("alibi table missing after growth");
        };
        let start = if self.config.use_positive_positions {
            0
        } else {
            table.positions - key_len
        };
        table.bias.narrow(2, start, key_len)
    }

    /// Adds the bias to `scores [batch, heads, queries, keys]`.
    pub fn apply(&self, scores: &Tensor, scale: f32) -> Result<Tensor> {
        let heads = scores.dim(1)?;
        self.apply_sharded(scores, scale, 0, heads)
    }

    /// Same as [`Alibi::apply`] for a rank holding heads
    /// `[first_head, first_head + heads)` of `total_heads`.
    pub fn apply_sharded(
        &self,
        scores: &Tensor,
        scale: f32,
        first_head: usize,
        total_heads: usize,
    ) -> Result<Tensor> {
        let (_, heads, _, key_len) = scores.dims4()?;
        if first_head + heads > total_heads {
            bail!("heads [{first_head}, {}) exceed the {total_heads} alibi heads", first_head + heads);
        }
        let mut bias = self
            .bias(total_heads, key_len, scores.device())?
            .narrow(0, first_head, heads)?;
        if self.config.scale_alibi {
            bias = bias.affine(scale as f64, 0.0)?;
        }
        let bias = bias.unsqueeze(0)?.to_dtype(scores.dtype())?;
        scores.broadcast_add(&bias)
    }
}
