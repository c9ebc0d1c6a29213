//! Lightweight validation helpers shared across layer components.
//!
//! Each helper takes a label naming the tensor under test so failures point at
//! the offending weight-store entry or argument. They return
//! `candle_core::Result<()>` and convert into [`LayerError`](crate::LayerError)
//! through `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has the requested number of dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the size of the innermost (feature) dimension.
pub fn expect_last_dim(label: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&actual) if actual == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected last dimension {size}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Returns true for the floating point dtypes accepted as activations or weights.
pub fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn failures_name_the_tensor() -> Result<()> {
        let tensor = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        expect_shape("dense.weight", &tensor, &[2, 3])?;
        expect_last_dim("dense.input", &tensor, 3)?;

        let err = expect_rank("dense.bias", &tensor, 1).unwrap_err();
        assert!(err.to_string().contains("dense.bias"));
        let err = expect_dtype_in("dense.weight", &tensor, &[DType::I64]).unwrap_err();
        assert!(err.to_string().contains("I64"));
        Ok(())
    }
}
