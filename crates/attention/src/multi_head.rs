//! Multi-head attention layer bound to a weight-store scope.
//!
//! The layer projects queries, keys and values through `linear_0..linear_2`,
//! runs the exact kernel over `[batch, heads, time, head_dim]` tensors and
//! projects the merged heads through `linear_3`. Keys and values may use fewer
//! heads than queries. Under tensor parallelism each rank owns
//! `num_heads / world_size` query heads and the partial outputs of `linear_3`
//! are summed across ranks.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use embedding::positional::Alibi;
use layers::norm::LayerNorm;
use layers::store::{scoped, WeightStore};
use layers::{Communicator, Dense, DenseOptions};

use crate::core::{Attention, AttentionConfig, AttentionError, AttentionResult, KernelConfig};
use crate::kv_cache::KvCache;
use crate::masks::{
    build_causal_mask, build_sliding_window_mask, length_mask_to_additive, prepare_length_mask,
};
use crate::positional::{HeadRange, PositionalEncoding, PositionalVariant};
use crate::reference::ExactAttention;

/// Per-call inputs of [`MultiHeadAttention::forward`].
#[derive(Debug)]
pub struct AttentionInputs<'a> {
    /// `[batch, q_len, d_model]`.
    pub queries: &'a Tensor,
    /// Cross-attention source `[batch, k_len, d_model]`.
    pub values: Option<&'a Tensor>,
    /// Valid key count per batch entry, `[batch]`.
    pub values_lengths: Option<&'a Tensor>,
    pub cache: Option<&'a mut KvCache>,
    /// Absolute position of the first query.
    pub offset: usize,
    pub return_attention: bool,
    /// Return post-softmax weights instead of raw masked scores.
    pub return_normalized_attention: bool,
    /// Bias returned by an earlier layer, reused instead of recomputed.
    pub position_bias: Option<&'a Tensor>,
}

impl<'a> AttentionInputs<'a> {
    pub fn new(queries: &'a Tensor) -> Self {
        Self {
            queries,
            values: None,
            values_lengths: None,
            cache: None,
            offset: 0,
            return_attention: false,
            return_normalized_attention: true,
            position_bias: None,
        }
    }

    pub fn with_values(mut self, values: &'a Tensor) -> Self {
        self.values = Some(values);
        self
    }

    pub fn with_lengths(mut self, lengths: &'a Tensor) -> Self {
        self.values_lengths = Some(lengths);
        self
    }

    pub fn with_cache(mut self, cache: &'a mut KvCache, offset: usize) -> Self {
        self.cache = Some(cache);
        self.offset = offset;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn return_attention(mut self, normalized: bool) -> Self {
        self.return_attention = true;
        self.return_normalized_attention = normalized;
        self
    }

    pub fn with_position_bias(mut self, bias: &'a Tensor) -> Self {
        self.position_bias = Some(bias);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, q_len, d_model]`.
    pub output: Tensor,
    /// `[batch, local_heads, q_len, k_len]` when requested.
    pub attention: Option<Tensor>,
    /// Bucketed relative bias, reusable by later layers.
    pub position_bias: Option<Tensor>,
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    scope: String,
    config: AttentionConfig,
    query_proj: Dense,
    key_proj: Dense,
    value_proj: Dense,
    output_proj: Dense,
    layer_norm: Option<LayerNorm>,
    positional: PositionalEncoding,
    kernel: ExactAttention,
    kernel_config: KernelConfig,
    communicator: Arc<dyn Communicator>,
    local_heads: usize,
    local_kv_heads: usize,
    head_dim: usize,
    d_model: usize,
}

impl MultiHeadAttention {
    /// Binds the projections under `scope/linear_{0..3}` and selects the
    /// positional variant.
    pub fn new(
        store: &dyn WeightStore,
        scope: &str,
        config: AttentionConfig,
        alibi: Option<Arc<Alibi>>,
        communicator: Arc<dyn Communicator>,
    ) -> AttentionResult<Self> {
        let mut config = config;
        config.apply_env_overrides();
        let world = communicator.world_size();
        config.validate(world)?;

        let dense = |index: usize, is_layer_out: bool| -> AttentionResult<Dense> {
            let options = DenseOptions {
                activation: None,
                is_layer_out,
                quantization: config.quantization.clone(),
                communicator: Arc::clone(&communicator),
            };
            Ok(Dense::new(store, &scoped(scope, &format!("linear_{index}")), options)?)
        };
        let query_proj = dense(0, false)?;
        let key_proj = dense(1, false)?;
        let value_proj = dense(2, false)?;
        let output_proj = dense(3, true)?;

        let local_heads = config.num_heads / world;
        let local_kv_heads = config.kv_heads() / world;
        let head_dim = match config.head_dim {
            Some(dim) => dim,
            None => {
                if query_proj.output_size() % local_heads != 0 {
                    return Err(AttentionError::shape(format!(
                        "{scope}: query projection width {} is not divisible by {local_heads} heads",
                        query_proj.output_size()
                    )));
                }
                query_proj.output_size() / local_heads
            }
        };
        let d_model = query_proj.input_size();

        let expected = [
            ("linear_0", query_proj.output_size(), local_heads * head_dim),
            ("linear_1", key_proj.output_size(), local_kv_heads * head_dim),
            ("linear_2", value_proj.output_size(), local_kv_heads * head_dim),
            ("linear_3", output_proj.input_size(), local_heads * head_dim),
        ];
        for (name, got, want) in expected {
            if got != want {
                return Err(AttentionError::shape(format!(
                    "{scope}/{name}: expected {want} features for {local_heads} heads ({local_kv_heads} kv) of {head_dim}, got {got}"
                )));
            }
        }
        for (name, proj) in [("linear_1", &key_proj), ("linear_2", &value_proj)] {
            if proj.input_size() != d_model {
                return Err(AttentionError::shape(format!(
                    "{scope}/{name}: input features {} differ from the query projection's {d_model}",
                    proj.input_size()
                )));
            }
        }
        if output_proj.output_size() != d_model {
            return Err(AttentionError::shape(format!(
                "{scope}/linear_3: output features {} differ from d_model {d_model}",
                output_proj.output_size()
            )));
        }

        let scale = match config.queries_scale {
            Some(scale) => scale,
            None => store
                .get_scalar_if_exists(&scoped(scope, "queries_scale"))?
                .unwrap_or(1.0 / (head_dim as f32).sqrt()),
        };
        let kernel_config = KernelConfig::new(scale).with_precision(config.precision);

        let layer_norm = LayerNorm::new_if_exists(store, &scoped(scope, "layer_norm"))?;
        let positional = PositionalEncoding::from_store(store, scope, &config, head_dim, alibi)?;

        log::info!(
            "attention {scope}: heads={}/{} kv_heads={}/{} head_dim={head_dim} positional={} window={:?} norm={} rank={}/{world}",
            local_heads,
            config.num_heads,
            local_kv_heads,
            config.kv_heads(),
            positional.name(),
            config.sliding_window,
            match (&layer_norm, config.pre_norm) {
                (None, _) => "none",
                (Some(_), true) => "pre",
                (Some(_), false) => "post",
            },
            communicator.rank()
        );

        Ok(Self {
            scope: scope.to_string(),
            config,
            query_proj,
            key_proj,
            value_proj,
            output_proj,
            layer_norm,
            positional,
            kernel: ExactAttention::new(),
            kernel_config,
            communicator,
            local_heads,
            local_kv_heads,
            head_dim,
            d_model,
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Query heads computed on this rank.
    pub fn num_heads(&self) -> usize {
        self.local_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.local_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn output_size(&self) -> usize {
        self.output_proj.output_size()
    }

    pub fn queries_scale(&self) -> f32 {
        self.kernel_config.scale
    }

    pub fn positional(&self) -> &PositionalEncoding {
        &self.positional
    }

    pub fn has_positional_embeddings(&self) -> bool {
        self.positional.applies_position_transform()
    }

    fn split_heads(&self, x: &Tensor, heads: usize) -> AttentionResult<Tensor> {
        let (batch, time, _) = x.dims3()?;
        Ok(x
            .reshape((batch, time, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn merge_heads(&self, x: &Tensor) -> AttentionResult<Tensor> {
        let (batch, heads, time, head_dim) = x.dims4()?;
        Ok(x.transpose(1, 2)?.reshape((batch, time, heads * head_dim))?)
    }

    fn head_range(&self) -> HeadRange {
        HeadRange {
            first: self.communicator.rank() * self.local_heads,
            local: self.local_heads,
            total: self.config.num_heads,
        }
    }

    /// Projects and caches keys/values, returning the tensors to attend over
    /// and the absolute position of their first entry.
    fn keys_and_values(
        &self,
        hidden: &Tensor,
        values: Option<&Tensor>,
        cache: Option<&mut KvCache>,
        offset: usize,
    ) -> AttentionResult<(Tensor, Tensor, usize)> {
        if self.config.self_attention {
            let keys = self.split_heads(&self.key_proj.forward(hidden)?, self.local_kv_heads)?;
            let keys = self.positional.rotate(&keys, offset)?;
            let values = self.split_heads(&self.value_proj.forward(hidden)?, self.local_kv_heads)?;
            let Some(cache) = cache else {
                return Ok((keys, values, 0));
            };
            if offset == 0 {
                cache.clear();
            }
            let start = cache.start();
            let (keys, values) = cache.append(&keys, &values)?;
            if let Some(window) = self.config.sliding_window {
                cache.evict_to_window(window)?;
            }
            return Ok((keys, values, start));
        }

        if let Some(cache) = cache {
            if offset > 0 && !cache.is_empty() {
                if let (Some(keys), Some(values)) = (cache.keys(), cache.values()) {
                    return Ok((keys.clone(), values.clone(), 0));
                }
            }
            let source = values.ok_or_else(|| {
                AttentionError::config(format!(
                    "{}: cross-attention needs values on the first step",
                    self.scope
                ))
            })?;
            let keys = self.split_heads(&self.key_proj.forward(source)?, self.local_kv_heads)?;
            let values = self.split_heads(&self.value_proj.forward(source)?, self.local_kv_heads)?;
            cache.replace(keys.clone(), values.clone())?;
            return Ok((keys, values, 0));
        }

        let source = values.ok_or_else(|| {
            AttentionError::config(format!("{}: cross-attention needs values", self.scope))
        })?;
        let keys = self.split_heads(&self.key_proj.forward(source)?, self.local_kv_heads)?;
        let values = self.split_heads(&self.value_proj.forward(source)?, self.local_kv_heads)?;
        Ok((keys, values, 0))
    }

    /// Sums the padding, causal and sliding-window masks, `[batch | 1, 1, q_len, k_len]`.
    fn build_mask(
        &self,
        device: &candle_core::Device,
        lengths: Option<&Tensor>,
        key_start: usize,
        q_len: usize,
        k_len: usize,
    ) -> AttentionResult<Option<Tensor>> {
        let causal = self.config.self_attention && self.config.is_decoder;
        let past = k_len.saturating_sub(q_len);
        let mut mask = None;

        if let Some(lengths) = lengths {
            let shifted: Vec<u32> = lengths
                .to_dtype(DType::U32)?
                .to_vec1::<u32>()?
                .into_iter()
                .map(|length| length.saturating_sub(key_start as u32))
                .collect();
            let shifted = Tensor::new(shifted.as_slice(), device)?;
            let counts = prepare_length_mask(&shifted, 1, q_len, causal, false, past)?;
            mask = Some(length_mask_to_additive(&counts, k_len)?);
        } else if causal && q_len > 1 {
            mask = Some(build_causal_mask(device, 1, 1, q_len, k_len)?);
        }

        if let (true, Some(window)) = (self.config.self_attention, self.config.sliding_window) {
            if k_len > window {
                let sliding = build_sliding_window_mask(device, 1, 1, q_len, k_len, window)?;
                mask = Some(match mask {
                    Some(mask) => mask.broadcast_add(&sliding)?,
                    None => sliding,
                });
            }
        }
        Ok(mask)
    }

    pub fn forward(&self, inputs: AttentionInputs<'_>) -> AttentionResult<AttentionOutput> {
        let AttentionInputs {
            queries,
            values,
            values_lengths,
            cache,
            offset,
            return_attention,
            return_normalized_attention,
            position_bias,
        } = inputs;

        let (_, q_len, width) = queries.dims3()?;
        if width != self.d_model {
            return Err(AttentionError::shape(format!(
                "{}: queries have {width} features, expected {}",
                self.scope, self.d_model
            )));
        }
        if cache.is_some() && !self.positional.supports_incremental_cache() {
            return Err(AttentionError::config(format!(
                "{}: {} positions cannot be used with an incremental cache",
                self.scope,
                self.positional.name()
            )));
        }

        let hidden = match (&self.layer_norm, self.config.pre_norm) {
            (Some(norm), true) => norm.forward(queries)?,
            _ => queries.clone(),
        };

        let q = self.split_heads(&self.query_proj.forward(&hidden)?, self.local_heads)?;
        let q = self.positional.rotate(&q, offset)?;
        let (k, v, key_start) = self.keys_and_values(&hidden, values, cache, offset)?;
        let k_len = k.dims()[2];

        let mask = self.build_mask(queries.device(), values_lengths, key_start, q_len, k_len)?;
        let positional_bias = self.positional.score_bias(
            &q,
            k_len,
            self.kernel_config.scale,
            self.head_range(),
            position_bias,
        )?;
        let bias = match (&mask, &positional_bias) {
            (Some(mask), Some(extra)) => Some(mask.broadcast_add(extra)?),
            (Some(mask), None) => Some(mask.clone()),
            (None, Some(extra)) => Some(extra.clone()),
            (None, None) => None,
        };

        let probs = self
            .kernel
            .attend(&q, &k, &v, bias.as_ref(), &self.kernel_config)?;
        let context = self
            .positional
            .add_relative_values(&probs.context, &probs.weights)?;

        let mut output = self.output_proj.forward(&self.merge_heads(&context)?)?;
        if self.communicator.is_parallel() {
            output = self.communicator.all_reduce_sum(&output)?;
        }
        if let Some(norm) = &self.layer_norm {
            output = output.add(queries)?;
            if !self.config.pre_norm {
                output = norm.forward(&output)?;
            }
        }

        let attention = return_attention.then(|| {
            if return_normalized_attention {
                probs.weights
            } else {
                probs.scores
            }
        });
        let position_bias = match &self.positional {
            PositionalEncoding::RelativeBias { .. } => positional_bias,
            _ => None,
        };

        Ok(AttentionOutput {
            output,
            attention,
            position_bias,
        })
    }
}
