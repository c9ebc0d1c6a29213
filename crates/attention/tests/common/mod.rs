#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use layers::store::MemoryWeightStore;

pub const SCOPE: &str = "decoder/layer_0/self_attention";

pub fn name(entry: &str) -> String {
    format!("{SCOPE}/{entry}")
}

/// Projection weights for `heads` query heads and `kv_heads` key/value heads.
#[derive(Debug, Clone)]
pub struct Projections {
    pub query: (Tensor, Tensor),
    pub key: (Tensor, Tensor),
    pub value: (Tensor, Tensor),
    pub output: (Tensor, Tensor),
}

impl Projections {
    pub fn random(
        d_model: usize,
        heads: usize,
        kv_heads: usize,
        head_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let pair = |out: usize, inp: usize| -> Result<(Tensor, Tensor)> {
            Ok((
                Tensor::randn(0f32, 0.3, (out, inp), device)?,
                Tensor::randn(0f32, 0.1, out, device)?,
            ))
        };
        Ok(Self {
            query: pair(heads * head_dim, d_model)?,
            key: pair(kv_heads * head_dim, d_model)?,
            value: pair(kv_heads * head_dim, d_model)?,
            output: pair(d_model, heads * head_dim)?,
        })
    }

    pub fn store(&self) -> MemoryWeightStore {
        let mut store = MemoryWeightStore::new();
        for (index, (weight, bias)) in [&self.query, &self.key, &self.value, &self.output]
            .into_iter()
            .enumerate()
        {
            store.insert(name(&format!("linear_{index}/weight")), weight.clone());
            store.insert(name(&format!("linear_{index}/bias")), bias.clone());
        }
        store
    }
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_vec0::<f32>()?)
}

/// Softmax attention over `[batch, heads, time, head_dim]` tensors with
/// repeated key/value heads and an optional additive mask.
pub fn naive_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let heads = q.dim(1)?;
    let kv_heads = k.dim(1)?;
    let repeat = |t: &Tensor| -> Result<Tensor> {
        let groups = heads / kv_heads;
        let parts: Vec<Tensor> = (0..heads)
            .map(|h| t.narrow(1, h / groups, 1))
            .collect::<candle_core::Result<_>>()?;
        Ok(Tensor::cat(&parts, 1)?)
    };
    let k = repeat(k)?;
    let v = repeat(v)?;
    let mut scores = q
        .contiguous()?
        .matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?
        .affine(scale, 0.0)?;
    if let Some(mask) = mask {
        scores = scores.broadcast_add(mask)?;
    }
    let probs = softmax_last_dim(&scores)?;
    Ok(probs.matmul(&v.contiguous()?)?)
}

pub fn split_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let (batch, time, width) = x.dims3()?;
    Ok(x.reshape((batch, time, heads, width / heads))?
        .transpose(1, 2)?
        .contiguous()?)
}

pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (batch, heads, time, head_dim) = x.dims4()?;
    Ok(x.transpose(1, 2)?.reshape((batch, time, heads * head_dim))?)
}

pub fn project(x: &Tensor, (weight, bias): &(Tensor, Tensor)) -> Result<Tensor> {
    Ok(x.broadcast_matmul(&weight.t()?)?.broadcast_add(bias)?)
}

/// Rank-4 counterpart of candle's `to_vec3`, which candle does not provide.
pub trait ToVec4 {
    fn to_vec4<T: candle_core::WithDType>(&self) -> Result<Vec<Vec<Vec<Vec<T>>>>>;
}

impl ToVec4 for Tensor {
    fn to_vec4<T: candle_core::WithDType>(&self) -> Result<Vec<Vec<Vec<Vec<T>>>>> {
        let (outer, _, _, _) = self.dims4()?;
        (0..outer)
            .map(|i| Ok(self.get(i)?.to_vec3::<T>()?))
            .collect()
    }
}
