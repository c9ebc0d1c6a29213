//! Activations that can be fused onto the output of a projection.
//!
//! Inputs are promoted to the compute dtype of the supplied
//! [`PrecisionPolicy`] before the non-linearity runs and cast back to storage
//! afterwards, so `f16`/`bf16` activations never evaluate `erf`/`tanh` in
//! reduced precision.
//!
//! # Formulas
//!
//! * **Gelu** uses erf: `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **GeluTanh** uses the tanh approximation.
//! * **GeluSigmoid** uses `x * sigmoid(1.702 * x)`.
//! * **Swish** computes `x * sigmoid(x)`.

use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::ops::sigmoid;
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    GeluTanh,
    Swish,
    Gelu,
    GeluSigmoid,
    Tanh,
    Sigmoid,
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

#[derive(Debug)]
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let x = policy.cast_for_matmul(input)?;
        let y = match self.kind {
            ActivationKind::Relu => x.relu()?,
            ActivationKind::Gelu => x.gelu_erf()?,
            ActivationKind::GeluTanh => x.gelu()?,
            ActivationKind::GeluSigmoid => (&x * sigmoid(&x.affine(1.702, 0.0)?)?)?,
            ActivationKind::Swish => x.silu()?,
            ActivationKind::Tanh => x.tanh()?,
            ActivationKind::Sigmoid => sigmoid(&x)?,
        };
        policy.cast_to_storage(&y)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}
