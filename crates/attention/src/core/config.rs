//! Configuration for attention layers and kernels.
//!
//! [`AttentionConfig`] describes the geometry and options of one attention
//! layer and is read once at construction. [`KernelConfig`] carries the
//! run-time knobs of the scaled dot-product kernel.

use embedding::positional::RotaryConfig;
use layers::QuantizationConfig;
use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, AttentionResult};

/// Environment variable forcing attention math to `f32`.
pub const FORCE_F32_ENV: &str = "ATTENTION_FORCE_F32";

/// Default clipping distance of bucketed relative attention bias.
pub const DEFAULT_RELATIVE_MAX_DISTANCE: usize = 128;

/// Dtype used for scores, softmax and the weighted sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionPrecision {
    /// Compute in the input dtype.
    #[default]
    Inherit,
    /// Upcast half-precision inputs to `f32` and cast the result back.
    ForceF32,
}

/// Window of relative distances covered by a relative-position table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeRange {
    /// Distances `[-m, m]`, table of `2m + 1` rows.
    #[default]
    Symmetric,
    /// Distances `[-m, 0]`, table of `m + 1` rows.
    PastOnly,
}

impl RelativeRange {
    /// Maximum distance encoded by a table of `rows` entries.
    pub fn max_position(self, rows: usize) -> AttentionResult<usize> {
        match self {
            Self::Symmetric if rows % 2 == 1 => Ok(rows / 2),
            Self::Symmetric => Err(AttentionError::shape(format!(
                "symmetric relative table needs an odd number of rows, got {rows}"
            ))),
            Self::PastOnly if rows > 0 => Ok(rows - 1),
            Self::PastOnly => Err(AttentionError::shape("empty relative position table")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativeAttentionConfig {
    /// Layout of `relative_position_keys` / `relative_position_values`.
    pub range: RelativeRange,
    /// Bucket clipping distance used when the store has no
    /// `relative_attention_max_distance` entry.
    pub max_distance: usize,
}

impl Default for RelativeAttentionConfig {
    fn default() -> Self {
        Self {
            range: RelativeRange::Symmetric,
            max_distance: DEFAULT_RELATIVE_MAX_DISTANCE,
        }
    }
}

/// Geometry and options of one attention layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Total query heads across all ranks.
    pub num_heads: usize,
    /// Total key/value heads; `None` means one per query head.
    pub num_heads_kv: Option<usize>,
    /// Defaults to the query projection width divided by the local head count.
    pub head_dim: Option<usize>,
    pub self_attention: bool,
    pub is_decoder: bool,
    pub pre_norm: bool,
    pub sliding_window: Option<usize>,
    /// Overrides both the store entry and `1 / sqrt(head_dim)`.
    pub queries_scale: Option<f32>,
    pub rotary: Option<RotaryConfig>,
    pub relative: RelativeAttentionConfig,
    pub quantization: QuantizationConfig,
    pub precision: AttentionPrecision,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 1,
            num_heads_kv: None,
            head_dim: None,
            self_attention: true,
            is_decoder: false,
            pre_norm: true,
            sliding_window: None,
            queries_scale: None,
            rotary: None,
            relative: RelativeAttentionConfig::default(),
            quantization: QuantizationConfig::default(),
            precision: AttentionPrecision::Inherit,
        }
    }
}

impl AttentionConfig {
    pub fn new(num_heads: usize) -> Self {
        Self {
            num_heads,
            ..Self::default()
        }
    }

    pub fn kv_heads(&self) -> usize {
        self.num_heads_kv.unwrap_or(self.num_heads)
    }

    /// Applies `ATTENTION_FORCE_F32` and the quantization overrides.
    pub fn apply_env_overrides(&mut self) {
        if env_flag(FORCE_F32_ENV) {
            self.precision = AttentionPrecision::ForceF32;
        }
        self.quantization.apply_env_overrides();
    }

    /// Checks head counts against each other and against `world_size`.
    pub fn validate(&self, world_size: usize) -> AttentionResult<()> {
        let heads = self.num_heads;
        let kv_heads = self.kv_heads();
        if heads == 0 || kv_heads == 0 {
            return Err(AttentionError::shape("head counts must be non-zero"));
        }
        if heads % kv_heads != 0 {
            return Err(AttentionError::shape(format!(
                "num_heads ({heads}) must be a multiple of num_heads_kv ({kv_heads})"
            )));
        }
        if heads % world_size != 0 || kv_heads % world_size != 0 {
            return Err(AttentionError::shape(format!(
                "num_heads ({heads}) and num_heads_kv ({kv_heads}) must be divisible by the world size ({world_size})"
            )));
        }
        if self.sliding_window == Some(0) {
            return Err(AttentionError::config("sliding_window must be at least 1"));
        }
        if self.rotary.is_some() && !self.self_attention {
            return Err(AttentionError::config(
                "rotary embeddings are only supported in self-attention",
            ));
        }
        Ok(())
    }
}

/// Run-time options of the scaled dot-product kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelConfig {
    /// Multiplier applied to `Q·Kᵗ` before any bias is added.
    pub scale: f32,
    pub precision: AttentionPrecision,
}

impl KernelConfig {
    pub fn new(scale: f32) -> Self {
        Self {
            scale,
            precision: AttentionPrecision::Inherit,
        }
    }

    pub fn for_head_dim(head_dim: usize) -> Self {
        Self::new(1.0 / (head_dim as f32).sqrt())
    }

    pub fn with_precision(mut self, precision: AttentionPrecision) -> Self {
        self.precision = precision;
        self
    }

    pub fn apply_env_overrides(&mut self) {
        if env_flag(FORCE_F32_ENV) {
            self.precision = AttentionPrecision::ForceF32;
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_heads_must_divide() {
        let config = AttentionConfig {
            num_heads: 6,
            num_heads_kv: Some(4),
            ..AttentionConfig::default()
        };
        assert!(matches!(
            config.validate(1),
            Err(AttentionError::InvalidShape { .. })
        ));
    }

    #[test]
    fn heads_must_split_across_ranks() {
        let config = AttentionConfig {
            num_heads: 8,
            num_heads_kv: Some(2),
            ..AttentionConfig::default()
        };
        assert!(config.validate(2).is_ok());
        assert!(config.validate(4).is_err());
    }

    #[test]
    fn relative_ranges_derive_max_position() {
        assert_eq!(RelativeRange::Symmetric.max_position(9).ok(), Some(4));
        assert_eq!(RelativeRange::PastOnly.max_position(5).ok(), Some(4));
        assert!(RelativeRange::Symmetric.max_position(8).is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: AttentionConfig =
            serde_json::from_str(r#"{"num_heads": 8, "num_heads_kv": 1, "is_decoder": true}"#)
                .expect("valid json");
        assert_eq!(config.kv_heads(), 1);
        assert!(config.self_attention);
        assert!(config.pre_norm);
        assert_eq!(config.relative.max_distance, DEFAULT_RELATIVE_MAX_DISTANCE);
        assert_eq!(config.precision, AttentionPrecision::Inherit);
    }
}
