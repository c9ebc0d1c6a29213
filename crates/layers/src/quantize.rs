//! Quantization kernels used by [`Dense`](crate::dense::Dense).
//!
//! Two families are supported:
//!
//! * **Integer** (`int8`/`int16`). Values are stored in `i64` lanes because the
//!   tensor backend has no narrow signed integer dtype; the configured
//!   [`IntWidth`] bounds their range. Scales follow the multiply convention
//!   `q = round(x * scale)`, so dequantization divides. Integer products are
//!   accumulated in `f64`, which is exact for every representable `int16`
//!   dot product below 2^53.
//! * **Affine 4-bit** (`scale + zero-point`). Weights are packed as `u32`
//!   words holding eight consecutive output columns, lowest nibble first:
//!   `qweight [in, out / 8]`, `zeros [in / group, out / 8]` and
//!   `scales [in / group, out]`. A weight dequantizes to
//!   `(q - zero) * scale`.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{checks, LayerError, LayerResult};

/// Environment variable overriding [`QuantizationConfig::affine_gemm_min_rows`].
pub const AFFINE_GEMM_MIN_ROWS_ENV: &str = "LAYERS_AFFINE_GEMM_MIN_ROWS";
/// Default rows threshold above which affine weights are dequantized up front.
pub const DEFAULT_AFFINE_GEMM_MIN_ROWS: usize = 1024;
/// Scale shared by every layer under [`ScalePolicy::Global`].
pub const GLOBAL_INT16_SCALE: f32 = 1000.0;
/// Offset applied to int8 values when shifting them to the unsigned range.
pub const UINT8_SHIFT: i64 = 128;
/// 4-bit values packed into one `u32` word.
pub const NIBBLES_PER_WORD: usize = 8;

/// Kernel family requested for quantized weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantMethod {
    /// Integer quantization with per-tensor or per-channel scales.
    #[default]
    Ct2,
    /// 4-bit affine weights, batched GEMM kernel.
    AwqGemm,
    /// 4-bit affine weights, low-batch GEMV kernel.
    AwqGemv,
}

impl QuantMethod {
    pub fn is_affine(self) -> bool {
        matches!(self, Self::AwqGemm | Self::AwqGemv)
    }
}

/// Integer width of quantized activations and weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntWidth {
    #[default]
    Int8,
    Int16,
}

impl IntWidth {
    /// Largest magnitude representable symmetrically.
    pub fn max_value(self) -> f32 {
        match self {
            Self::Int8 => 127.0,
            Self::Int16 => 32767.0,
        }
    }
}

/// How input scales are chosen at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalePolicy {
    /// One fixed scale shared by every layer.
    Global,
    /// One scale per input row, `max_int / amax(row)`.
    #[default]
    PerRow,
}

/// Quantization knobs shared by every quantized projection of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    pub method: QuantMethod,
    pub width: IntWidth,
    pub scale_policy: ScalePolicy,
    /// Scale used under [`ScalePolicy::Global`].
    pub global_scale: f32,
    /// Shift int8 inputs by +128; requires a `weight_compensation` entry.
    pub shift_to_uint8: bool,
    /// Round to nearest before the integer cast instead of truncating.
    pub round_before_cast: bool,
    /// Rows (batch x sequence) from which affine GEMM dequantizes the full weight.
    pub affine_gemm_min_rows: usize,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            method: QuantMethod::Ct2,
            width: IntWidth::Int8,
            scale_policy: ScalePolicy::PerRow,
            global_scale: GLOBAL_INT16_SCALE,
            shift_to_uint8: false,
            round_before_cast: true,
            affine_gemm_min_rows: DEFAULT_AFFINE_GEMM_MIN_ROWS,
        }
    }
}

impl QuantizationConfig {
    /// Convenience constructor for the affine kernels.
    pub fn affine(method: QuantMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Applies `LAYERS_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(AFFINE_GEMM_MIN_ROWS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(rows) => self.affine_gemm_min_rows = rows,
                Err(_) => log::warn!("ignoring invalid {AFFINE_GEMM_MIN_ROWS_ENV}={raw:?}"),
            }
        }
    }

    pub(crate) fn validate(&self) -> LayerResult<()> {
        if self.shift_to_uint8 && self.width != IntWidth::Int8 {
            return Err(LayerError::config(
                "shift_to_uint8 is only defined for int8 quantization",
            ));
        }
        if self.scale_policy == ScalePolicy::Global && self.width != IntWidth::Int16 {
            return Err(LayerError::config(format!(
                "the global quantization scale is only defined for int16, got {:?}",
                self.width
            )));
        }
        if self.scale_policy == ScalePolicy::Global && self.global_scale <= 0.0 {
            return Err(LayerError::config(format!(
                "global quantization scale must be positive, got {}",
                self.global_scale
            )));
        }
        Ok(())
    }
}

/// Integer values with one scale per row.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    /// `i64` values shaped `[rows, cols]`, shifted by [`UINT8_SHIFT`] when `shifted`.
    pub values: Tensor,
    /// `f32` scales shaped `[rows]`.
    pub scales: Tensor,
    pub shifted: bool,
}

/// Quantizes a 2D float tensor row by row.
pub fn quantize(x: &Tensor, config: &QuantizationConfig) -> LayerResult<QuantizedTensor> {
    config.validate()?;
    let (rows, cols) = x.dims2()?;
    let data = x.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let max_int = config.width.max_value();

    let mut values = Vec::with_capacity(rows * cols);
    let mut scales = Vec::with_capacity(rows);
    for row in &data {
        let scale = match config.scale_policy {
            ScalePolicy::Global => config.global_scale,
            ScalePolicy::PerRow => {
                let amax = row.iter().fold(0f32, |acc, v| acc.max(v.abs()));
                if amax > 0.0 {
                    max_int / amax
                } else {
                    1.0
                }
            }
        };
        scales.push(scale);
        for &value in row {
            let scaled = value * scale;
            let scaled = if config.round_before_cast {
                scaled.round()
            } else {
                scaled.trunc()
            };
            let q = scaled.clamp(-max_int, max_int) as i64;
            values.push(if config.shift_to_uint8 { q + UINT8_SHIFT } else { q });
        }
    }

    let device = x.device();
    Ok(QuantizedTensor {
        values: Tensor::from_vec(values, (rows, cols), device)?,
        scales: Tensor::from_vec(scales, rows, device)?,
        shifted: config.shift_to_uint8,
    })
}

/// Restores `f32` values from [`quantize`] output.
pub fn dequantize(q: &QuantizedTensor) -> LayerResult<Tensor> {
    let mut values = q.values.to_dtype(DType::F32)?;
    if q.shifted {
        values = values.affine(1.0, -(UINT8_SHIFT as f64))?;
    }
    Ok(values.broadcast_div(&q.scales.unsqueeze(1)?)?)
}

/// Exact integer product `a · bᵗ` for `a [m, k]` and `b [n, k]`, returned as `f64`.
pub fn integer_gemm(a: &Tensor, b: &Tensor) -> LayerResult<Tensor> {
    let (_, k) = a.dims2()?;
    let (_, kb) = b.dims2()?;
    if k != kb {
        return Err(LayerError::shape(format!(
            "integer gemm inner dimensions differ: {k} vs {kb}"
        )));
    }
    let a = a.to_dtype(DType::F64)?;
    let b = b.to_dtype(DType::F64)?;
    Ok(a.matmul(&b.t()?)?)
}

/// Weight-side compensation for inputs shifted by [`UINT8_SHIFT`]:
/// `-128 · Σ_k W[n, k]` for integer weights `W [n, k]`.
pub fn shift_compensation(weight: &Tensor) -> LayerResult<Tensor> {
    let sums = weight.to_dtype(DType::F64)?.sum(1)?;
    Ok(sums.affine(-(UINT8_SHIFT as f64), 0.0)?.to_dtype(DType::F32)?)
}

/// Validates affine tensor shapes and returns `(in_features, out_features, group_size)`.
pub fn affine_geometry(
    qweight: &Tensor,
    scales: &Tensor,
    zeros: &Tensor,
) -> LayerResult<(usize, usize, usize)> {
    if qweight.dtype() != DType::U32 || zeros.dtype() != DType::U32 {
        return Err(LayerError::config(format!(
            "affine weights must be packed u32 words, got weight {:?} and zeros {:?}",
            qweight.dtype(),
            zeros.dtype()
        )));
    }
    checks::expect_dtype_in("weight_scale", scales, &[DType::F16, DType::BF16, DType::F32])?;
    let (in_features, words) = qweight.dims2()?;
    let (groups, out_features) = scales.dims2()?;
    let out_words = zeros.dims2()?;
    if out_features != words * NIBBLES_PER_WORD {
        return Err(LayerError::shape(format!(
            "affine scales cover {out_features} outputs but weight packs {}",
            words * NIBBLES_PER_WORD
        )));
    }
    if out_words != (groups, words) {
        return Err(LayerError::shape(format!(
            "affine zeros expected [{groups}, {words}], got {:?}",
            zeros.dims()
        )));
    }
    if groups == 0 || in_features % groups != 0 {
        return Err(LayerError::shape(format!(
            "{in_features} input features cannot be split into {groups} groups"
        )));
    }
    Ok((in_features, out_features, in_features / groups))
}

fn nibble(word: u32, index: usize) -> u32 {
    (word >> (4 * index)) & 0xF
}

/// Expands affine weights to a dense `f32` matrix `[in, out]`.
pub fn affine_dequantize(qweight: &Tensor, scales: &Tensor, zeros: &Tensor) -> LayerResult<Tensor> {
    let (in_features, out_features, group) = affine_geometry(qweight, scales, zeros)?;
    let q = qweight.to_vec2::<u32>()?;
    let z = zeros.to_vec2::<u32>()?;
    let s = scales.to_dtype(DType::F32)?.to_vec2::<f32>()?;

    let mut dense = Vec::with_capacity(in_features * out_features);
    for (i, words) in q.iter().enumerate() {
        let g = i / group;
        for (c, &word) in words.iter().enumerate() {
            for j in 0..NIBBLES_PER_WORD {
                let col = c * NIBBLES_PER_WORD + j;
                let delta = nibble(word, j) as f32 - nibble(z[g][c], j) as f32;
                dense.push(delta * s[g][col]);
            }
        }
    }
    Ok(Tensor::from_vec(
        dense,
        (in_features, out_features),
        qweight.device(),
    )?)
}

/// Batched affine kernel: dequantize once, then a dense `x · W`.
pub fn affine_gemm(
    x: &Tensor,
    qweight: &Tensor,
    scales: &Tensor,
    zeros: &Tensor,
) -> LayerResult<Tensor> {
    let weight = affine_dequantize(qweight, scales, zeros)?;
    Ok(x.to_dtype(DType::F32)?.matmul(&weight)?)
}

/// Low-batch affine kernel working directly on packed words.
pub fn affine_gemv(
    x: &Tensor,
    qweight: &Tensor,
    scales: &Tensor,
    zeros: &Tensor,
) -> LayerResult<Tensor> {
    let (in_features, out_features, group) = affine_geometry(qweight, scales, zeros)?;
    let (rows, cols) = x.dims2()?;
    if cols != in_features {
        return Err(LayerError::shape(format!(
            "affine input has {cols} features, weight expects {in_features}"
        )));
    }
    let xs = x.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let q = qweight.to_vec2::<u32>()?;
    let z = zeros.to_vec2::<u32>()?;
    let s = scales.to_dtype(DType::F32)?.to_vec2::<f32>()?;

    let mut out = vec![0f32; rows * out_features];
    for (r, row) in xs.iter().enumerate() {
        let acc = &mut out[r * out_features..(r + 1) * out_features];
        for (i, &xv) in row.iter().enumerate() {
            if xv == 0.0 {
                continue;
            }
            let g = i / group;
            for (c, &word) in q[i].iter().enumerate() {
                let zero_word = z[g][c];
                for j in 0..NIBBLES_PER_WORD {
                    let col = c * NIBBLES_PER_WORD + j;
                    let delta = nibble(word, j) as f32 - nibble(zero_word, j) as f32;
                    acc[col] += xv * delta * s[g][col];
                }
            }
        }
    }
    Ok(Tensor::from_vec(out, (rows, out_features), x.device())?)
}

/// Packs 4-bit values laid out `[rows, cols]` into `u32` words `[rows, cols / 8]`.
pub fn pack_int4(values: &[u8], rows: usize, cols: usize, device: &Device) -> LayerResult<Tensor> {
    if values.len() != rows * cols || cols % NIBBLES_PER_WORD != 0 {
        return Err(LayerError::shape(format!(
            "cannot pack {} values as [{rows}, {cols}] in {NIBBLES_PER_WORD}-nibble words",
            values.len()
        )));
    }
    let words: Vec<u32> = values
        .chunks(NIBBLES_PER_WORD)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u32, |word, (j, &v)| word | (u32::from(v & 0xF) << (4 * j)))
        })
        .collect();
    Ok(Tensor::from_vec(
        words,
        (rows, cols / NIBBLES_PER_WORD),
        device,
    )?)
}
