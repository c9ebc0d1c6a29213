//! Precision policy used by projections and attention math.
//!
//! Weights and activations may be stored as `f16`/`bf16` while matmuls and
//! softmax run in `f32`. A [`PrecisionPolicy`] derived from the activation
//! dtype tells each call site which dtype to compute in and which to return.

use candle_core::{DType, Result, Tensor};

/// Storage and compute dtypes for one forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType) -> Self {
        Self { storage, compute }
    }

    /// Half precision storage computes in `f32`; wider types compute natively.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor back to the storage dtype.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
