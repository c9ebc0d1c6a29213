//! Dense projection with weight-driven execution paths.
//!
//! A [`Dense`] layer is bound once to a weight-store scope. The entries found
//! under that scope select a [`DenseWeights`] variant which stays fixed for the
//! lifetime of the layer:
//!
//! | entries                                         | variant      |
//! |-------------------------------------------------|--------------|
//! | `low_rank_weight_1`, `low_rank_weight_2`        | `LowRank`    |
//! | `weight_packed`                                 | `Packed`     |
//! | `weight` + `weight_scale` + `weight_zero`       | `Affine`     |
//! | `weight` + `weight_scale`                       | `Quantized`  |
//! | `weight`                                        | `Plain`      |
//!
//! Inputs are `[..., in_features]`; outputs `[..., out_features]`. Plain
//! weights are `[out, in]`, packed weights are already `[in, out]`, low-rank
//! factors are `[in, rank]` and `[rank, out]`.
//!
//! Under tensor parallelism the final projection of a layer (`is_layer_out`)
//! receives inputs sharded along features and its partial outputs are summed
//! by the caller; only rank 0 adds the bias so it is counted once.

use std::sync::{Arc, RwLock};

use candle_core::{DType, Tensor};

use crate::activations::{self, Activation, ActivationKind};
use crate::checks;
use crate::dtypes::PrecisionPolicy;
use crate::parallel::{Communicator, SingleRank};
use crate::quantize::{self, QuantMethod, QuantizationConfig};
use crate::store::{scoped, WeightStore};
use crate::{LayerError, LayerResult};

/// The single weight representation a [`Dense`] layer executes with.
#[derive(Debug, Clone)]
pub enum DenseWeights {
    /// Float weight `[out, in]`.
    Plain { weight: Tensor },
    /// Float weight pre-transposed to `[in, out]`.
    Packed { weight: Tensor },
    /// Factorised weight, `W ≈ first · second`.
    LowRank { first: Tensor, second: Tensor },
    /// Integer weight `[out, in]` with a scalar or `[out]` scale.
    Quantized {
        weight: Tensor,
        scale: Tensor,
        compensation: Option<Tensor>,
    },
    /// 4-bit packed weight with per-group scales and zero points.
    Affine {
        qweight: Tensor,
        scales: Tensor,
        zeros: Tensor,
    },
}

impl DenseWeights {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plain { .. } => "plain",
            Self::Packed { .. } => "packed",
            Self::LowRank { .. } => "low_rank",
            Self::Quantized { .. } => "quantized",
            Self::Affine { .. } => "affine",
        }
    }

    fn features(&self) -> LayerResult<(usize, usize)> {
        let (input, output) = match self {
            Self::Plain { weight } | Self::Quantized { weight, .. } => {
                let (out, inp) = weight.dims2()?;
                (inp, out)
            }
            Self::Packed { weight } => weight.dims2()?,
            Self::LowRank { first, second } => {
                let (inp, rank) = first.dims2()?;
                let (rank2, out) = second.dims2()?;
                if rank != rank2 {
                    return Err(LayerError::shape(format!(
                        "low-rank factors disagree on rank: {rank} vs {rank2}"
                    )));
                }
                (inp, out)
            }
            Self::Affine {
                qweight,
                scales,
                zeros,
            } => {
                let (inp, out, _) = quantize::affine_geometry(qweight, scales, zeros)?;
                (inp, out)
            }
        };
        Ok((input, output))
    }
}

/// Rows gathered by [`Dense::select_weights`].
#[derive(Debug, Clone)]
struct PartialWeights {
    weight: Tensor,
    bias: Option<Tensor>,
    scale: Option<Tensor>,
    compensation: Option<Tensor>,
    output_size: usize,
}

/// Construction options for [`Dense`].
#[derive(Debug, Clone)]
pub struct DenseOptions {
    /// Activation fused after the bias.
    pub activation: Option<ActivationKind>,
    /// Marks the final projection of a layer, whose outputs are reduced across ranks.
    pub is_layer_out: bool,
    pub quantization: QuantizationConfig,
    pub communicator: Arc<dyn Communicator>,
}

impl Default for DenseOptions {
    fn default() -> Self {
        Self {
            activation: None,
            is_layer_out: false,
            quantization: QuantizationConfig::default(),
            communicator: Arc::new(SingleRank),
        }
    }
}

/// Linear projection bound to one weight-store scope.
#[derive(Debug)]
pub struct Dense {
    scope: String,
    weights: DenseWeights,
    bias: Option<Tensor>,
    partial: RwLock<Option<PartialWeights>>,
    activation: Option<Arc<dyn Activation>>,
    quantization: QuantizationConfig,
    is_layer_out: bool,
    communicator: Arc<dyn Communicator>,
    input_size: usize,
    output_size: usize,
}

impl Dense {
    /// Binds the layer to `scope`, selecting its execution path from the entries present.
    pub fn new(store: &dyn WeightStore, scope: &str, options: DenseOptions) -> LayerResult<Self> {
        let DenseOptions {
            activation,
            is_layer_out,
            quantization,
            communicator,
        } = options;
        quantization.validate()?;

        let entry = |name: &str| store.get_if_exists(&scoped(scope, name));
        let weights = Self::select_representation(store, scope, &quantization, &entry)?;
        let (input_size, output_size) = weights.features()?;

        let bias = entry("bias");
        if let Some(bias) = &bias {
            checks::expect_shape(&scoped(scope, "bias"), bias, &[output_size])?;
        }

        log::info!(
            "dense {scope}: path={} in={input_size} out={output_size} bias={} activation={:?} rank={}/{}",
            weights.kind(),
            bias.is_some(),
            activation,
            communicator.rank(),
            communicator.world_size()
        );

        Ok(Self {
            scope: scope.to_string(),
            weights,
            bias,
            partial: RwLock::new(None),
            activation: activation.map(activations::builtin),
            quantization,
            is_layer_out,
            communicator,
            input_size,
            output_size,
        })
    }

    fn select_representation(
        store: &dyn WeightStore,
        scope: &str,
        quantization: &QuantizationConfig,
        entry: &dyn Fn(&str) -> Option<Tensor>,
    ) -> LayerResult<DenseWeights> {
        let scale = entry("weight_scale");
        let zero = entry("weight_zero");
        let packed = entry("weight_packed");
        let low_rank_1 = entry("low_rank_weight_1");
        let low_rank_2 = entry("low_rank_weight_2");

        if low_rank_1.is_some() || low_rank_2.is_some() {
            let conflicting: Vec<&str> = [
                ("weight", entry("weight").is_some()),
                ("weight_packed", packed.is_some()),
                ("weight_scale", scale.is_some()),
                ("weight_zero", zero.is_some()),
            ]
            .into_iter()
            .filter_map(|(name, present)| present.then_some(name))
            .collect();
            if !conflicting.is_empty() {
                return Err(LayerError::config(format!(
                    "{scope}: low-rank weights cannot be combined with {}",
                    conflicting.join(", ")
                )));
            }
            let first = store.get(&scoped(scope, "low_rank_weight_1"))?;
            let second = store.get(&scoped(scope, "low_rank_weight_2"))?;
            return Ok(DenseWeights::LowRank { first, second });
        }

        if let Some(weight) = packed {
            if scale.is_some() || zero.is_some() {
                return Err(LayerError::config(format!(
                    "{scope}: packed weights cannot be quantized"
                )));
            }
            checks::expect_rank(&scoped(scope, "weight_packed"), &weight, 2)?;
            return Ok(DenseWeights::Packed { weight });
        }

        let weight = store.get(&scoped(scope, "weight"))?;
        checks::expect_rank(&scoped(scope, "weight"), &weight, 2)?;

        match (scale, zero) {
            (Some(scales), Some(zeros)) => {
                if !quantization.method.is_affine() {
                    return Err(LayerError::config(format!(
                        "{scope}: zero-point weights require an affine method, got {:?}",
                        quantization.method
                    )));
                }
                quantize::affine_geometry(&weight, &scales, &zeros)?;
                Ok(DenseWeights::Affine {
                    qweight: weight,
                    scales,
                    zeros,
                })
            }
            (None, Some(_)) => Err(LayerError::MissingWeight(scoped(scope, "weight_scale"))),
            (Some(scale), None) => {
                if quantization.method.is_affine() {
                    return Err(LayerError::config(format!(
                        "{scope}: {:?} requires a weight_zero entry",
                        quantization.method
                    )));
                }
                if checks::is_float(weight.dtype()) {
                    return Err(LayerError::config(format!(
                        "{scope}: weight_scale given for float weight {:?}",
                        weight.dtype()
                    )));
                }
                let out_features = weight.dim(0)?;
                if scale.elem_count() != 1 {
                    checks::expect_shape(&scoped(scope, "weight_scale"), &scale, &[out_features])?;
                }
                // Compensation only undoes the +128 input shift.
                let compensation = match entry("weight_compensation") {
                    Some(_) if !quantization.shift_to_uint8 => {
                        log::debug!("dense {scope}: ignoring weight_compensation without u8 shift");
                        None
                    }
                    None if quantization.shift_to_uint8 => {
                        return Err(LayerError::MissingWeight(scoped(scope, "weight_compensation")));
                    }
                    other => other,
                };
                if let Some(compensation) = &compensation {
                    checks::expect_shape(
                        &scoped(scope, "weight_compensation"),
                        compensation,
                        &[out_features],
                    )?;
                }
                Ok(DenseWeights::Quantized {
                    weight: weight.to_dtype(DType::I64)?,
                    scale: scale.to_dtype(DType::F32)?,
                    compensation,
                })
            }
            (None, None) => {
                if !checks::is_float(weight.dtype()) {
                    return Err(LayerError::MissingWeight(scoped(scope, "weight_scale")));
                }
                Ok(DenseWeights::Plain { weight })
            }
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn weights(&self) -> &DenseWeights {
        &self.weights
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Input features expected on this rank.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Output features produced, honouring an active weight selection.
    pub fn output_size(&self) -> usize {
        match self.partial.read() {
            Ok(guard) => guard
                .as_ref()
                .map(|p| p.output_size)
                .unwrap_or(self.output_size),
            Err(_) => self.output_size,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.partial.read().map(|g| g.is_some()).unwrap_or(false)
    }

    fn affected_by_tp(&self) -> bool {
        self.is_layer_out && self.communicator.is_parallel()
    }

    fn applies_bias(&self) -> bool {
        !self.affected_by_tp() || self.communicator.rank() == 0
    }

    /// Restricts the output features to the rows listed in `index`.
    ///
    /// Weight, bias, compensation and per-channel scale rows are gathered into
    /// a shadow copy used by every later call; `extra_bias` is added to the
    /// gathered bias. Passing `None` drops the selection.
    pub fn select_weights(
        &self,
        index: Option<&Tensor>,
        extra_bias: Option<&Tensor>,
    ) -> LayerResult<()> {
        let Some(index) = index else {
            *self.write_partial()? = None;
            log::debug!("dense {}: cleared weight selection", self.scope);
            return Ok(());
        };

        let index = index.flatten_all()?;
        let index = if index.dtype() == DType::U32 || index.dtype() == DType::I64 {
            index
        } else {
            index.to_dtype(DType::U32)?
        };
        let selected = index.dim(0)?;

        let (weight, scale, compensation) = match &self.weights {
            DenseWeights::Plain { weight } => (weight.index_select(&index, 0)?, None, None),
            DenseWeights::Quantized {
                weight,
                scale,
                compensation,
            } => {
                let scale = if scale.elem_count() == 1 {
                    scale.clone()
                } else {
                    scale.index_select(&index, 0)?
                };
                let compensation = compensation
                    .as_ref()
                    .map(|c| c.index_select(&index, 0))
                    .transpose()?;
                (weight.index_select(&index, 0)?, Some(scale), compensation)
            }
            other => {
                return Err(LayerError::config(format!(
                    "{}: weight selection is not supported for {} weights",
                    self.scope,
                    other.kind()
                )))
            }
        };

        let mut bias = self
            .bias
            .as_ref()
            .map(|b| b.index_select(&index, 0))
            .transpose()?;
        if let Some(extra) = extra_bias {
            checks::expect_shape("select_weights.extra_bias", extra, &[selected])?;
            bias = Some(match bias {
                Some(b) => b.add(&extra.to_dtype(b.dtype())?)?,
                None => extra.clone(),
            });
        }

        *self.write_partial()? = Some(PartialWeights {
            weight,
            bias,
            scale,
            compensation,
            output_size: selected,
        });
        log::debug!(
            "dense {}: selected {selected} of {} output rows",
            self.scope,
            self.output_size
        );
        Ok(())
    }

    fn write_partial(&self) -> LayerResult<std::sync::RwLockWriteGuard<'_, Option<PartialWeights>>> {
        self.partial.write().map_err(|_| self.poisoned())
    }

    fn poisoned(&self) -> LayerError {
        LayerError::Backend(candle_core::Error::Msg(format!(
            "{}: partial weights lock poisoned",
            self.scope
        )))
    }

    /// Projects `input [..., in]` to `[..., out]`.
    pub fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        checks::expect_last_dim(&format!("{}.input", self.scope), input, self.input_size)?;
        let dims = input.dims().to_vec();
        let rows: usize = dims[..dims.len() - 1].iter().product();
        let policy = PrecisionPolicy::from_parameter_dtype(input.dtype());
        let x = policy.cast_for_matmul(&input.reshape((rows, self.input_size))?)?;

        let partial = self.partial.read().map_err(|_| self.poisoned())?;
        let partial = partial.as_ref();

        let mut output = match &self.weights {
            DenseWeights::Plain { weight } => {
                let weight = partial.map(|p| &p.weight).unwrap_or(weight);
                x.matmul(&policy.cast_for_matmul(weight)?.t()?)?
            }
            DenseWeights::Packed { weight } => x.matmul(&policy.cast_for_matmul(weight)?)?,
            DenseWeights::LowRank { first, second } => x
                .matmul(&policy.cast_for_matmul(first)?)?
                .matmul(&policy.cast_for_matmul(second)?)?,
            DenseWeights::Quantized {
                weight,
                scale,
                compensation,
            } => {
                let (weight, scale, compensation) = match partial {
                    Some(p) => (&p.weight, p.scale.as_ref().unwrap_or(scale), p.compensation.as_ref()),
                    None => (weight, scale, compensation.as_ref()),
                };
                self.quantized_matmul(&x, weight, scale, compensation)?
                    .to_dtype(policy.compute())?
            }
            DenseWeights::Affine {
                qweight,
                scales,
                zeros,
            } => self.affine_matmul(&x, qweight, scales, zeros)?.to_dtype(policy.compute())?,
        };

        if self.applies_bias() {
            let bias = match partial {
                Some(p) => p.bias.as_ref(),
                None => self.bias.as_ref(),
            };
            if let Some(bias) = bias {
                output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
            }
        }

        // Stay in compute dtype until the single cast back to storage below.
        if let Some(activation) = &self.activation {
            let compute = PrecisionPolicy::new(policy.compute(), policy.compute());
            output = activation.forward(&output, &compute)?;
        }

        let out_features = output.dim(1)?;
        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = out_features;
        }
        Ok(policy.cast_to_storage(&output.reshape(out_dims)?)?)
    }

    /// Integer path: quantize the input, integer GEMM, dequantize.
    fn quantized_matmul(
        &self,
        x: &Tensor,
        weight: &Tensor,
        scale: &Tensor,
        compensation: Option<&Tensor>,
    ) -> LayerResult<Tensor> {
        // The input scale must see every feature, not only this rank's shard.
        let quantized = if self.affected_by_tp() {
            let full = self.communicator.all_gather(x, 1)?;
            let mut q = quantize::quantize(&full, &self.quantization)?;
            let start = self.communicator.rank() * self.input_size;
            q.values = q.values.narrow(1, start, self.input_size)?;
            q
        } else {
            quantize::quantize(x, &self.quantization)?
        };

        let mut acc = quantize::integer_gemm(&quantized.values, weight)?;
        if let Some(compensation) = compensation {
            acc = acc.broadcast_add(&compensation.to_dtype(DType::F64)?.unsqueeze(0)?)?;
        }

        let out_features = weight.dim(0)?;
        let weight_scale = if scale.elem_count() == 1 {
            scale.reshape((1, 1))?
        } else {
            scale.reshape((1, out_features))?
        };
        let denom = quantized
            .scales
            .unsqueeze(1)?
            .broadcast_mul(&weight_scale)?
            .to_dtype(DType::F64)?;
        Ok(acc.broadcast_div(&denom)?.to_dtype(DType::F32)?)
    }

    fn affine_matmul(
        &self,
        x: &Tensor,
        qweight: &Tensor,
        scales: &Tensor,
        zeros: &Tensor,
    ) -> LayerResult<Tensor> {
        let rows = x.dim(0)?;
        match self.quantization.method {
            QuantMethod::AwqGemm if rows >= self.quantization.affine_gemm_min_rows => {
                quantize::affine_gemm(x, qweight, scales, zeros)
            }
            QuantMethod::AwqGemm | QuantMethod::AwqGemv => {
                quantize::affine_gemv(x, qweight, scales, zeros)
            }
            QuantMethod::Ct2 => Err(LayerError::config(format!(
                "{}: affine weights cannot run with method {:?}",
                self.scope, self.quantization.method
            ))),
        }
    }
}
