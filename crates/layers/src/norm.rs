//! Layer normalisation bound from a weight store.
//!
//! A norm scope holds `gamma` and, for standard LayerNorm, `beta`. A scope with
//! only `gamma` is treated as RMSNorm. Statistics are computed along the last
//! axis in at least `f32` and the result is cast back to the input dtype.

use candle_core::{DType, Tensor, D};

use crate::store::{scoped, WeightStore};
use crate::{checks, LayerResult};

/// Normalisation flavour, decided by the entries present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    kind: NormKind,
    gamma: Tensor,
    beta: Option<Tensor>,
    epsilon: f64,
}

impl LayerNorm {
    pub const DEFAULT_EPSILON: f64 = 1e-5;

    /// Loads `<scope>/gamma` and the optional `<scope>/beta`.
    pub fn new(store: &dyn WeightStore, scope: &str) -> LayerResult<Self> {
        let gamma = store.get(&scoped(scope, "gamma"))?;
        checks::expect_rank(&scoped(scope, "gamma"), &gamma, 1)?;
        let beta = store.get_if_exists(&scoped(scope, "beta"));
        if let Some(beta) = &beta {
            checks::expect_shape(&scoped(scope, "beta"), beta, gamma.dims())?;
        }
        let kind = if beta.is_some() {
            NormKind::LayerNorm
        } else {
            NormKind::RmsNorm
        };
        Ok(Self {
            kind,
            gamma,
            beta,
            epsilon: Self::DEFAULT_EPSILON,
        })
    }

    /// Loads the norm only when `<scope>/gamma` exists.
    pub fn new_if_exists(store: &dyn WeightStore, scope: &str) -> LayerResult<Option<Self>> {
        if store.contains(&scoped(scope, "gamma")) {
            Self::new(store, scope).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn kind(&self) -> NormKind {
        self.kind
    }

    pub fn forward(&self, hidden: &Tensor) -> LayerResult<Tensor> {
        let hidden_size = self.gamma.dim(0)?;
        checks::expect_last_dim("norm.input", hidden, hidden_size)?;

        let dtype = hidden.dtype();
        let compute = if dtype == DType::F64 { DType::F64 } else { DType::F32 };
        let mut x = hidden.to_dtype(compute)?;
        let n = hidden_size as f64;

        if self.kind == NormKind::LayerNorm {
            let mean = (x.sum_keepdim(D::Minus1)? / n)?;
            x = x.broadcast_sub(&mean)?;
        }
        let variance = (x.sqr()?.sum_keepdim(D::Minus1)? / n)?;
        let denom = (variance + self.epsilon)?.sqrt()?;
        let mut normalized = x
            .broadcast_div(&denom)?
            .broadcast_mul(&self.gamma.to_dtype(compute)?)?;
        if let Some(beta) = &self.beta {
            normalized = normalized.broadcast_add(&beta.to_dtype(compute)?)?;
        }
        Ok(normalized.to_dtype(dtype)?)
    }
}
