//! Reference attention kernel.
//!
//! Grouped-query inputs are handled without repeating keys: the query heads of
//! one group are folded into the query axis, `[batch, kv_heads, groups * q_len,
//! head_dim]`, so a single batched matmul covers every head of the group.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax_last_dim;

use crate::core::{
    Attention, AttentionError, AttentionPrecision, AttentionProbs, AttentionResult, KernelConfig,
};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

fn work_dtype(dtype: DType, precision: AttentionPrecision) -> DType {
    match (precision, dtype) {
        (AttentionPrecision::ForceF32, DType::F16 | DType::BF16) => DType::F32,
        _ => dtype,
    }
}

fn check_bias(bias: &Tensor, target: &[usize; 4]) -> AttentionResult<()> {
    let dims = bias.dims();
    let compatible = dims.len() == 4
        && dims
            .iter()
            .zip(target.iter())
            .all(|(&got, &want)| got == 1 || got == want);
    if compatible {
        Ok(())
    } else {
        Err(AttentionError::shape(format!(
            "bias {dims:?} does not broadcast to {target:?}"
        )))
    }
}

/// Replaces rows whose scores are all `-inf` (NaN after softmax) with zeros.
fn zero_masked_rows(scores: &Tensor, probs: &Tensor) -> candle_core::Result<Tensor> {
    let row_max = scores.max_keepdim(D::Minus1)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, row_max.shape(), row_max.device())?
        .to_dtype(row_max.dtype())?;
    let live = row_max.ne(&neg_inf)?.broadcast_as(probs.shape())?;
    live.where_cond(probs, &probs.zeros_like()?)
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        config: &KernelConfig,
    ) -> AttentionResult<AttentionProbs> {
        let mut cfg = *config;
        cfg.apply_env_overrides();

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init precision={:?} dtype={:?} device={:?}",
                cfg.precision,
                q.dtype(),
                q.device().location()
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !dtype.is_float() {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| AttentionError::shape("q must have shape [batch, heads, q_len, head_dim]"))?;
        let (kb, kv_heads, k_len, kd) = k
            .dims4()
            .map_err(|_| AttentionError::shape("k must have shape [batch, kv_heads, k_len, head_dim]"))?;
        if kb != batch || kd != head_dim || kv_heads == 0 || heads % kv_heads != 0 {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, divisor of {heads}, ?, {head_dim}] got [{kb}, {kv_heads}, {k_len}, {kd}]"
            )));
        }
        if v.dims() != k.dims() {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected {:?} got {:?}",
                k.dims(),
                v.dims()
            )));
        }
        if let Some(bias) = bias {
            if !device.same_device(bias.device()) {
                return Err(AttentionError::shape("bias must reside on the same device as q"));
            }
            check_bias(bias, &[batch, heads, q_len, k_len])?;
        }

        let groups = heads / kv_heads;
        let work = work_dtype(dtype, cfg.precision);

        let q_folded = q
            .to_dtype(work)?
            .contiguous()?
            .reshape((batch, kv_heads, groups * q_len, head_dim))?;
        let k_work = k.to_dtype(work)?.contiguous()?;
        let v_work = v.to_dtype(work)?.contiguous()?;

        let k_t = k_work.t()?.contiguous()?;
        let scores = q_folded.matmul(&k_t)?.affine(cfg.scale as f64, 0.0)?;
        let mut scores = scores.reshape((batch, heads, q_len, k_len))?;
        if let Some(bias) = bias {
            scores = scores.broadcast_add(&bias.to_dtype(work)?)?;
        }

        let probs = softmax_last_dim(&scores)?;
        let probs = zero_masked_rows(&scores, &probs)?;

        let context = probs
            .reshape((batch, kv_heads, groups * q_len, k_len))?
            .matmul(&v_work)?
            .reshape((batch, heads, q_len, head_dim))?;

        Ok(AttentionProbs {
            context: context.to_dtype(dtype)?,
            weights: probs.to_dtype(dtype)?,
            scores: scores.to_dtype(dtype)?,
        })
    }
}
