//! Rotary positional embeddings.
//!
//! Sin/cos tables are `f32` tensors shaped `[positions, rotary_dim / 2]`.
//! Angles are evaluated in `f64` per row, so a row's values depend only on its
//! position: regrowing the table to a larger size reproduces every existing
//! row bit for bit.
//!
//! Two layouts pair the rotated features:
//!
//! * interleaved: `(x[2i], x[2i + 1])`, as in the original rotary paper;
//! * half-split: `(x[i], x[i + rotary_dim / 2])`, as in GPT-NeoX style models.
//!
//! Features beyond `rotary_dim` pass through unchanged.

use candle_core::{bail, DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROTARY_BASE: f32 = 10_000.0;
pub const DEFAULT_INITIAL_POSITIONS: usize = 2048;

fn default_low_freq_factor() -> f32 {
    1.0
}

fn default_high_freq_factor() -> f32 {
    4.0
}

/// Context-extension strategy applied to rotary angles.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RotaryScaling {
    #[default]
    None,
    /// Positions are divided by `factor` before the angle lookup.
    Linear { factor: f32 },
    /// Two-segment scaling: `short_factor` divides the frequencies of
    /// positions inside the original context, `long_factor` those beyond it.
    /// The factor is chosen per position, not once per sequence, so a short
    /// prefix keeps its angles after the sequence grows past the original context.
    Su {
        long_factor: Vec<f32>,
        short_factor: Vec<f32>,
    },
    /// Per-frequency interpolation between unscaled high frequencies and
    /// low frequencies divided by `factor`. Without an explicit factor it is
    /// derived as `max_position_embeddings / original_max_position_embeddings`.
    Llama3 {
        #[serde(default)]
        factor: Option<f32>,
        #[serde(default = "default_low_freq_factor")]
        low_freq_factor: f32,
        #[serde(default = "default_high_freq_factor")]
        high_freq_factor: f32,
    },
}

/// Rotary configuration attached to an attention layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotaryConfig {
    /// Number of rotated features; `0` rotates the full head dimension.
    pub dim: usize,
    pub interleave: bool,
    pub scaling: RotaryScaling,
    pub base: f32,
    /// Growth increment of the sin/cos tables.
    pub num_initial_positions: usize,
    pub original_max_position_embeddings: usize,
    pub max_position_embeddings: usize,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self {
            dim: 0,
            interleave: true,
            scaling: RotaryScaling::None,
            base: DEFAULT_ROTARY_BASE,
            num_initial_positions: DEFAULT_INITIAL_POSITIONS,
            original_max_position_embeddings: 0,
            max_position_embeddings: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct RotaryTables {
    sin: Tensor,
    cos: Tensor,
    device: Device,
}

/// Rotary transform with lazily grown sin/cos tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbeddings {
    config: RotaryConfig,
    rotary_dim: usize,
    inv_freq: Vec<f64>,
    /// Frequencies used from `original_max_position_embeddings` onwards.
    long_inv_freq: Option<Vec<f64>>,
    mscale: f64,
    tables: Option<RotaryTables>,
}

impl RotaryEmbeddings {
    pub fn new(config: RotaryConfig, head_dim: usize) -> Result<Self> {
        let rotary_dim = if config.dim == 0 { head_dim } else { config.dim };
        if rotary_dim == 0 || rotary_dim > head_dim {
            bail!("invalid rotary dim {rotary_dim} for head_dim {head_dim}");
        }
        if rotary_dim % 2 != 0 {
            bail!("rotary dim must be even, got {rotary_dim}");
        }
        if config.base <= 0.0 {
            bail!("rotary base must be positive, got {}", config.base);
        }

        let half = rotary_dim / 2;
        let base = config.base as f64;
        let base_inv: Vec<f64> = (0..half)
            .map(|i| base.powf(-((2 * i) as f64) / rotary_dim as f64))
            .collect();
        let original = config.original_max_position_embeddings;

        let mut long_inv_freq = None;
        let mut mscale = 1.0;
        let inv_freq = match &config.scaling {
            RotaryScaling::None => base_inv,
            RotaryScaling::Linear { factor } => {
                if *factor <= 0.0 {
                    bail!("linear rotary factor must be positive, got {factor}");
                }
                base_inv.iter().map(|f| f / *factor as f64).collect()
            }
            RotaryScaling::Su {
                long_factor,
                short_factor,
            } => {
                if long_factor.len() != half || short_factor.len() != half {
                    bail!(
                        "su scaling factors must have {half} entries, got long={} short={}",
                        long_factor.len(),
                        short_factor.len()
                    );
                }
                if original == 0 {
                    bail!("su scaling requires original_max_position_embeddings");
                }
                let max = config.max_position_embeddings;
                if max > original {
                    let ratio = max as f64 / original as f64;
                    mscale = (1.0 + ratio.ln() / (original as f64).ln()).sqrt();
                }
                long_inv_freq = Some(
                    base_inv
                        .iter()
                        .zip(long_factor)
                        .map(|(f, s)| f / *s as f64)
                        .collect(),
                );
                base_inv
                    .iter()
                    .zip(short_factor)
                    .map(|(f, s)| f / *s as f64)
                    .collect()
            }
            RotaryScaling::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
            } => {
                if original == 0 {
                    bail!("llama3 scaling requires original_max_position_embeddings");
                }
                let factor = match factor {
                    Some(f) => *f as f64,
                    None if config.max_position_embeddings > 0 => {
                        config.max_position_embeddings as f64 / original as f64
                    }
                    None => bail!("llama3 scaling requires a factor or max_position_embeddings"),
                };
                let (low, high) = (*low_freq_factor as f64, *high_freq_factor as f64);
                if high <= low {
                    bail!("high_freq_factor ({high}) must exceed low_freq_factor ({low})");
                }
                let low_freq_wavelen = original as f64 / low;
                let high_freq_wavelen = original as f64 / high;
                base_inv
                    .iter()
                    .map(|&f| {
                        let wavelen = 2.0 * std::f64::consts::PI / f;
                        if wavelen < high_freq_wavelen {
                            f
                        } else if wavelen > low_freq_wavelen {
                            f / factor
                        } else {
                            let smooth = (original as f64 / wavelen - low) / (high - low);
                            (1.0 - smooth) * f / factor + smooth * f
                        }
                    })
                    .collect()
            }
        };

        Ok(Self {
            config,
            rotary_dim,
            inv_freq,
            long_inv_freq,
            mscale,
            tables: None,
        })
    }

    pub fn config(&self) -> &RotaryConfig {
        &self.config
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    /// Frequencies applied below the original context boundary.
    pub fn inv_freq(&self) -> &[f64] {
        &self.inv_freq
    }

    /// Number of positions currently covered by the tables.
    pub fn positions(&self) -> usize {
        self.tables
            .as_ref()
            .and_then(|t| t.sin.dim(0).ok())
            .unwrap_or(0)
    }

    /// Current `(sin, cos)` tables, if built.
    pub fn tables(&self) -> Option<(&Tensor, &Tensor)> {
        self.tables.as_ref().map(|t| (&t.sin, &t.cos))
    }

    fn build_tables(&self, positions: usize, device: &Device) -> Result<RotaryTables> {
        let half = self.rotary_dim / 2;
        let boundary = self.config.original_max_position_embeddings;
        let mut sin = Vec::with_capacity(positions * half);
        let mut cos = Vec::with_capacity(positions * half);
        for pos in 0..positions {
            let freqs = match &self.long_inv_freq {
                Some(long) if pos >= boundary => long,
                _ => &self.inv_freq,
            };
            for &f in freqs {
                let angle = pos as f64 * f;
                sin.push((angle.sin() * self.mscale) as f32);
                cos.push((angle.cos() * self.mscale) as f32);
            }
        }
        Ok(RotaryTables {
            sin: Tensor::from_vec(sin, (positions, half), device)?,
            cos: Tensor::from_vec(cos, (positions, half), device)?,
            device: device.clone(),
        })
    }

    /// Makes sure rows `[0, required)` exist on `device`, regrowing the whole table if not.
    pub fn ensure_positions(&mut self, required: usize, device: &Device) -> Result<()> {
        let current = match &self.tables {
            Some(tables) if tables.device.same_device(device) => tables.sin.dim(0)?,
            _ => 0,
        };
        if required <= current {
            return Ok(());
        }
        let target = required.max(current + self.config.num_initial_positions);
        self.tables = Some(self.build_tables(target, device)?);
        log::debug!(
            "rotary tables grown from {current} to {target} positions (dim={})",
            self.rotary_dim
        );
        Ok(())
    }

    /// Rotates `x [batch, heads, time, head_dim]` for positions `[offset, offset + time)`.
    pub fn apply(&mut self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (batch, heads, time, head_dim) = x.dims4()?;
        if head_dim < self.rotary_dim {
            bail!(
                "head_dim {head_dim} is smaller than rotary dim {}",
                self.rotary_dim
            );
        }
        self.ensure_positions(offset + time, x.device())?;
        let Some(tables) = &self.tables else {
            bail!("rotary tables missing after growth");
        };

        let half = self.rotary_dim / 2;
        let dtype = x.dtype();
        let sin = tables.sin.narrow(0, offset, time)?.reshape((1, 1, time, half))?;
        let cos = tables.cos.narrow(0, offset, time)?.reshape((1, 1, time, half))?;

        let main = x.narrow(3, 0, self.rotary_dim)?.to_dtype(DType::F32)?;
        let (first, second) = if self.config.interleave {
            let pairs = main.reshape((batch, heads, time, half, 2))?;
            (
                pairs.narrow(4, 0, 1)?.squeeze(4)?,
                pairs.narrow(4, 1, 1)?.squeeze(4)?,
            )
        } else {
            (main.narrow(3, 0, half)?, main.narrow(3, half, half)?)
        };

        let rotated_first = first
            .broadcast_mul(&cos)?
            .sub(&second.broadcast_mul(&sin)?)?;
        let rotated_second = second
            .broadcast_mul(&cos)?
            .add(&first.broadcast_mul(&sin)?)?;

        let rotated = if self.config.interleave {
            Tensor::stack(&[&rotated_first, &rotated_second], 4)?
                .reshape((batch, heads, time, self.rotary_dim))?
        } else {
            Tensor::cat(&[&rotated_first, &rotated_second], 3)?
        };
        let rotated = rotated.to_dtype(dtype)?;

        if head_dim == self.rotary_dim {
            Ok(rotated)
        } else {
            let tail = x.narrow(3, self.rotary_dim, head_dim - self.rotary_dim)?;
            Tensor::cat(&[&rotated, &tail], 3)
        }
    }
}
