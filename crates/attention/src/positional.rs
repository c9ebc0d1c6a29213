//! Positional variants an attention layer can be built with.
//!
//! Exactly one variant is selected at construction from the configuration and
//! the weights present under the layer scope:
//!
//! | variant        | selected by                                   |
//! |----------------|-----------------------------------------------|
//! | `Rotary`       | `AttentionConfig::rotary`                     |
//! | `Alibi`        | a shared [`Alibi`] passed to the constructor  |
//! | `RelativeKeys` | `relative_position_keys` / `_values` entries  |
//! | `RelativeBias` | `relative_attention_bias` entry               |

use std::sync::{Arc, Mutex};

use candle_core::{DType, Tensor};
use embedding::positional::{Alibi, RotaryEmbeddings};
use layers::store::{scoped, WeightStore};

use crate::core::{AttentionConfig, AttentionError, AttentionResult, RelativeRange};
use crate::masks::{make_relative_positions, relative_position_buckets};

/// Capabilities callers can query without matching on the variant.
pub trait PositionalVariant {
    /// The variant makes attention depend on token positions, so callers must
    /// track absolute offsets across decoding steps.
    fn applies_position_transform(&self) -> bool;
    /// Attention weights can be returned alongside the output.
    fn returns_attention_weights(&self) -> bool;
    /// The variant stays correct when keys come from an incremental cache.
    fn supports_incremental_cache(&self) -> bool;
}

#[derive(Debug)]
pub enum PositionalEncoding {
    None,
    Rotary(Mutex<RotaryEmbeddings>),
    Alibi(Arc<Alibi>),
    RelativeKeys {
        range: RelativeRange,
        max_position: usize,
        keys: Tensor,
        values: Tensor,
    },
    RelativeBias {
        /// `[num_buckets, heads]`.
        table: Tensor,
        max_distance: usize,
        bidirectional: bool,
    },
}

impl PositionalVariant for PositionalEncoding {
    fn applies_position_transform(&self) -> bool {
        !matches!(self, Self::None)
    }

    fn returns_attention_weights(&self) -> bool {
        true
    }

    fn supports_incremental_cache(&self) -> bool {
        !matches!(
            self,
            Self::RelativeBias {
                bidirectional: true,
                ..
            }
        )
    }
}

/// Head slice owned by the current rank.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeadRange {
    pub first: usize,
    pub local: usize,
    pub total: usize,
}

impl PositionalEncoding {
    pub(crate) fn from_store(
        store: &dyn WeightStore,
        scope: &str,
        config: &AttentionConfig,
        head_dim: usize,
        alibi: Option<Arc<Alibi>>,
    ) -> AttentionResult<Self> {
        let rel_keys = store.get_if_exists(&scoped(scope, "relative_position_keys"));
        let rel_bias = store.get_if_exists(&scoped(scope, "relative_attention_bias"));
        let selected = [
            config.rotary.is_some(),
            alibi.is_some(),
            rel_keys.is_some(),
            rel_bias.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();
        if selected > 1 {
            return Err(AttentionError::config(format!(
                "{scope}: rotary, ALiBi and relative positions are mutually exclusive"
            )));
        }

        if let Some(rotary) = &config.rotary {
            let rotary = RotaryEmbeddings::new(rotary.clone(), head_dim)?;
            return Ok(Self::Rotary(Mutex::new(rotary)));
        }
        if let Some(alibi) = alibi {
            return Ok(Self::Alibi(alibi));
        }
        if let Some(keys) = rel_keys {
            let values = store.get(&scoped(scope, "relative_position_values"))?;
            let (rows, dim) = keys.dims2()?;
            if dim != head_dim || values.dims() != keys.dims() {
                return Err(AttentionError::shape(format!(
                    "{scope}: relative position tables must be [rows, {head_dim}], got keys {:?} values {:?}",
                    keys.dims(),
                    values.dims()
                )));
            }
            let range = config.relative.range;
            return Ok(Self::RelativeKeys {
                range,
                max_position: range.max_position(rows)?,
                keys,
                values,
            });
        }
        if let Some(table) = rel_bias {
            let (buckets, _) = table.dims2()?;
            if buckets < 4 {
                return Err(AttentionError::shape(format!(
                    "{scope}: relative_attention_bias needs at least 4 buckets, got {buckets}"
                )));
            }
            let max_distance = store
                .get_scalar_if_exists(&scoped(scope, "relative_attention_max_distance"))?
                .map(|d| d as usize)
                .unwrap_or(config.relative.max_distance);
            return Ok(Self::RelativeBias {
                table,
                max_distance,
                bidirectional: !config.is_decoder,
            });
        }
        Ok(Self::None)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Rotary(_) => "rotary",
            Self::Alibi(_) => "alibi",
            Self::RelativeKeys { .. } => "relative_keys",
            Self::RelativeBias { .. } => "relative_bias",
        }
    }

    /// Rotates `x [batch, heads, time, head_dim]` at `offset`; identity for
    /// variants that do not rotate.
    pub(crate) fn rotate(&self, x: &Tensor, offset: usize) -> AttentionResult<Tensor> {
        match self {
            Self::Rotary(rotary) => {
                let mut rotary = rotary
                    .lock()
                    .map_err(|_| AttentionError::config("rotary table mutex poisoned"))?;
                Ok(rotary.apply(x, offset)?)
            }
            _ => Ok(x.clone()),
        }
    }

    /// Additive score terms, broadcastable to `[batch, heads, q_len, k_len]`.
    ///
    /// `position_bias` short-circuits the bucketed bias so later layers can
    /// reuse the tensor computed by the first one.
    pub(crate) fn score_bias(
        &self,
        q: &Tensor,
        k_len: usize,
        scale: f32,
        heads: HeadRange,
        position_bias: Option<&Tensor>,
    ) -> AttentionResult<Option<Tensor>> {
        let (_, _, q_len, _) = q.dims4()?;
        let device = q.device();
        match self {
            Self::None | Self::Rotary(_) => Ok(None),
            Self::Alibi(alibi) => {
                let zeros = Tensor::zeros((1, heads.local, 1, k_len), DType::F32, device)?;
                Ok(Some(alibi.apply_sharded(&zeros, scale, heads.first, heads.total)?))
            }
            Self::RelativeKeys {
                range,
                max_position,
                keys,
                ..
            } => {
                let table = self.gather(keys, q_len, k_len, *max_position, *range, q.dtype())?;
                let (batch, local, _, head_dim) = q.dims4()?;
                let logits = q
                    .permute((2, 0, 1, 3))?
                    .contiguous()?
                    .reshape((q_len, batch * local, head_dim))?
                    .matmul(&table.transpose(1, 2)?.contiguous()?)?
                    .reshape((q_len, batch, local, k_len))?
                    .permute((1, 2, 0, 3))?
                    .affine(scale as f64, 0.0)?;
                Ok(Some(logits.to_dtype(DType::F32)?))
            }
            Self::RelativeBias {
                table,
                max_distance,
                bidirectional,
            } => {
                if let Some(bias) = position_bias {
                    return Ok(Some(bias.clone()));
                }
                let (num_buckets, table_heads) = table.dims2()?;
                let first = if table_heads == heads.total {
                    heads.first
                } else if table_heads == heads.local {
                    0
                } else {
                    return Err(AttentionError::shape(format!(
                        "relative_attention_bias has {table_heads} heads, expected {} or {}",
                        heads.local, heads.total
                    )));
                };
                let buckets = relative_position_buckets(
                    q_len,
                    k_len,
                    num_buckets,
                    *max_distance,
                    *bidirectional,
                    device,
                )?;
                let bias = table
                    .index_select(&buckets.flatten_all()?, 0)?
                    .reshape((q_len, k_len, table_heads))?
                    .permute((2, 0, 1))?
                    .narrow(0, first, heads.local)?
                    .unsqueeze(0)?
                    .to_dtype(DType::F32)?
                    .contiguous()?;
                Ok(Some(bias))
            }
        }
    }

    /// Adds the relative-value term `Σ_j p[i, j] · E_v[i, j]` to `context`.
    pub(crate) fn add_relative_values(
        &self,
        context: &Tensor,
        weights: &Tensor,
    ) -> AttentionResult<Tensor> {
        let Self::RelativeKeys {
            range,
            max_position,
            values,
            ..
        } = self
        else {
            return Ok(context.clone());
        };
        let (batch, local, q_len, k_len) = weights.dims4()?;
        let head_dim = context.dims()[3];
        let table = self.gather(values, q_len, k_len, *max_position, *range, context.dtype())?;
        let term = weights
            .to_dtype(context.dtype())?
            .permute((2, 0, 1, 3))?
            .contiguous()?
            .reshape((q_len, batch * local, k_len))?
            .matmul(&table)?
            .reshape((q_len, batch, local, head_dim))?
            .permute((1, 2, 0, 3))?;
        Ok(context.add(&term)?)
    }

    /// Gathers `[q_len, k_len, head_dim]` rows of a relative-position table.
    fn gather(
        &self,
        table: &Tensor,
        q_len: usize,
        k_len: usize,
        max_position: usize,
        range: RelativeRange,
        dtype: DType,
    ) -> AttentionResult<Tensor> {
        let positions = make_relative_positions(q_len, k_len, max_position, range, table.device())?;
        let head_dim = table.dims()[1];
        Ok(table
            .index_select(&positions.flatten_all()?, 0)?
            .reshape((q_len, k_len, head_dim))?
            .to_dtype(dtype)?)
    }
}
