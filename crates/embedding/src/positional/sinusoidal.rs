//! Absolute position encodings added to token embeddings.

use candle_core::{bail, DType, Device, Result, Tensor};

pub const DEFAULT_SINUSOIDAL_POSITIONS: usize = 500;

/// Fixed sinusoidal encoding: `concat[sin(t * w), cos(t * w)]` with
/// `t = position + 1` and `w_i = exp(-i * ln(10000) / (depth / 2 - 1))`.
#[derive(Debug, Clone)]
pub struct SinusoidalPositionEncoder {
    depth: usize,
    table: Tensor,
}

fn sinusoidal_table(depth: usize, positions: usize, device: &Device) -> Result<Tensor> {
    let half = depth / 2;
    let increment = (10_000f64).ln() / (half as f64 - 1.0);
    let mut data = Vec::with_capacity(positions * depth);
    for pos in 0..positions {
        let time = (pos + 1) as f64;
        let scaled = (0..half).map(|i| time * (-(i as f64) * increment).exp());
        let row: Vec<f64> = scaled.collect();
        data.extend(row.iter().map(|v| v.sin() as f32));
        data.extend(row.iter().map(|v| v.cos() as f32));
    }
    Tensor::from_vec(data, (positions, depth), device)
}

impl SinusoidalPositionEncoder {
    pub fn new(depth: usize, device: &Device) -> Result<Self> {
        if depth < 4 || depth % 2 != 0 {
            bail!("sinusoidal depth must be even and at least 4, got {depth}");
        }
        Ok(Self {
            depth,
            table: sinusoidal_table(depth, DEFAULT_SINUSOIDAL_POSITIONS, device)?,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn positions(&self) -> usize {
        self.table.dims()[0]
    }

    /// Encodings for `[offset, offset + time)`, shaped `[time, depth]`.
    pub fn encodings(&mut self, offset: usize, time: usize, dtype: DType) -> Result<Tensor> {
        let required = offset + time;
        let current = self.positions();
        if required > current {
            let target = required.max(current + DEFAULT_SINUSOIDAL_POSITIONS);
            self.table = sinusoidal_table(self.depth, target, self.table.device())?;
            log::debug!("sinusoidal table grown from {current} to {target} positions");
        }
        self.table.narrow(0, offset, time)?.to_dtype(dtype)
    }

    /// Adds encodings to `input [batch, time, depth]` starting at `offset`.
    pub fn forward(&mut self, input: &Tensor, offset: usize) -> Result<Tensor> {
        let (_, time, depth) = input.dims3()?;
        if depth != self.depth {
            bail!("input depth {depth} does not match encoder depth {}", self.depth);
        }
        let encodings = self.encodings(offset, time, input.dtype())?;
        input.broadcast_add(&encodings.unsqueeze(0)?)
    }
}

/// Learned position table loaded with the model weights. Unlike the
/// sinusoidal encoder it cannot grow.
#[derive(Debug, Clone)]
pub struct LearnedPositionEmbedding {
    encodings: Tensor,
}

impl LearnedPositionEmbedding {
    pub fn new(encodings: Tensor) -> Result<Self> {
        if encodings.rank() != 2 {
            bail!(
                "position encodings must be [positions, depth], got {:?}",
                encodings.dims()
            );
        }
        Ok(Self { encodings })
    }

    pub fn max_positions(&self) -> usize {
        self.encodings.dims()[0]
    }

    pub fn depth(&self) -> usize {
        self.encodings.dims()[1]
    }

    pub fn forward(&self, input: &Tensor, offset: usize) -> Result<Tensor> {
        let (_, time, depth) = input.dims3()?;
        if depth != self.depth() {
            bail!("input depth {depth} does not match encoding depth {}", self.depth());
        }
        let max = self.max_positions();
        if offset + time > max {
            bail!(
                "No position encodings are defined for positions >= {max}, but got position {}",
                offset + time - 1
            );
        }
        let encodings = self
            .encodings
            .narrow(0, offset, time)?
            .to_dtype(input.dtype())?;
        input.broadcast_add(&encodings.unsqueeze(0)?)
    }
}
