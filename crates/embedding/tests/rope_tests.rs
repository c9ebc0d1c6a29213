use candle_core::{DType, Device, Result, Tensor};
use embedding::positional::rope::{RotaryConfig, RotaryEmbeddings, RotaryScaling};

fn assert_send_sync<T: Send + Sync>() {}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()
}

/// Scalar reference rotation of one head vector at `pos`.
fn rotate_naive(x: &[f32], pos: usize, rotary_dim: usize, base: f64, interleave: bool) -> Vec<f32> {
    let half = rotary_dim / 2;
    let mut out = x.to_vec();
    for i in 0..half {
        let freq = base.powf(-((2 * i) as f64) / rotary_dim as f64);
        let (sin, cos) = (pos as f64 * freq).sin_cos();
        let (a, b) = if interleave { (2 * i, 2 * i + 1) } else { (i, i + half) };
        let (xa, xb) = (x[a] as f64, x[b] as f64);
        out[a] = (xa * cos - xb * sin) as f32;
        out[b] = (xb * cos + xa * sin) as f32;
    }
    out
}

#[test]
fn rotary_types_are_send_sync() {
    assert_send_sync::<RotaryConfig>();
    assert_send_sync::<RotaryEmbeddings>();
}

#[test]
fn rotation_matches_scalar_reference_for_both_layouts() -> Result<()> {
    let device = Device::Cpu;
    let (heads, time, head_dim) = (2usize, 5usize, 8usize);
    let offset = 3;
    let x = Tensor::randn(0f32, 1.0, (1, heads, time, head_dim), &device)?;
    let rows = x.reshape((heads * time, head_dim))?.to_vec2::<f32>()?;

    for interleave in [true, false] {
        let mut rope = RotaryEmbeddings::new(
            RotaryConfig {
                interleave,
                ..RotaryConfig::default()
            },
            head_dim,
        )?;
        let out = rope.apply(&x, offset)?;
        let expected: Vec<f32> = rows
            .iter()
            .enumerate()
            .flat_map(|(r, row)| rotate_naive(row, offset + r % time, head_dim, 10_000.0, interleave))
            .collect();
        let expected = Tensor::from_vec(expected, (1, heads, time, head_dim), &device)?;
        assert!(max_abs_diff(&out, &expected)? < 1e-5, "interleave={interleave}");
    }
    Ok(())
}

#[test]
fn position_zero_is_identity() -> Result<()> {
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (2, 3, 1, 16), &device)?;
    let mut rope = RotaryEmbeddings::new(RotaryConfig::default(), 16)?;
    assert!(max_abs_diff(&rope.apply(&x, 0)?, &x)? < 1e-7);
    Ok(())
}

#[test]
fn tail_dimensions_pass_through() -> Result<()> {
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (1, 2, 4, 16), &device)?;
    let mut rope = RotaryEmbeddings::new(
        RotaryConfig {
            dim: 8,
            ..RotaryConfig::default()
        },
        16,
    )?;
    let out = rope.apply(&x, 7)?;
    assert_eq!(
        out.narrow(3, 8, 8)?.flatten_all()?.to_vec1::<f32>()?,
        x.narrow(3, 8, 8)?.flatten_all()?.to_vec1::<f32>()?
    );
    assert!(max_abs_diff(&out.narrow(3, 0, 8)?, &x.narrow(3, 0, 8)?)? > 0.0);
    Ok(())
}

#[test]
fn scores_depend_only_on_relative_distance() -> Result<()> {
    let device = Device::Cpu;
    let q = Tensor::randn(0f32, 1.0, (1, 1, 1, 8), &device)?;
    let k = Tensor::randn(0f32, 1.0, (1, 1, 1, 8), &device)?;
    let mut rope = RotaryEmbeddings::new(RotaryConfig::default(), 8)?;
    let score = |rope: &mut RotaryEmbeddings, m: usize, n: usize| -> Result<f32> {
        let q = rope.apply(&q, m)?;
        let k = rope.apply(&k, n)?;
        q.mul(&k)?.sum_all()?.to_vec0::<f32>()
    };
    let near = score(&mut rope, 5, 2)?;
    let far = score(&mut rope, 105, 102)?;
    assert!((near - far).abs() < 1e-4, "{near} vs {far}");
    Ok(())
}

#[test]
fn growth_preserves_existing_rows() -> Result<()> {
    let device = Device::Cpu;
    let mut rope = RotaryEmbeddings::new(
        RotaryConfig {
            num_initial_positions: 4,
            ..RotaryConfig::default()
        },
        8,
    )?;
    let x = Tensor::randn(0f32, 1.0, (1, 1, 2, 8), &device)?;
    let before = rope.apply(&x, 1)?;
    assert_eq!(rope.positions(), 4);

    rope.apply(&x, 9)?;
    assert_eq!(rope.positions(), 11);
    rope.ensure_positions(12, &device)?;
    assert_eq!(rope.positions(), 15);

    let after = rope.apply(&x, 1)?;
    assert_eq!(max_abs_diff(&before, &after)?, 0.0);
    Ok(())
}

#[test]
fn linear_scaling_divides_positions() -> Result<()> {
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (1, 1, 1, 8), &device)?;
    let mut scaled = RotaryEmbeddings::new(
        RotaryConfig {
            scaling: RotaryScaling::Linear { factor: 2.0 },
            ..RotaryConfig::default()
        },
        8,
    )?;
    let mut plain = RotaryEmbeddings::new(RotaryConfig::default(), 8)?;
    assert!(max_abs_diff(&scaled.apply(&x, 8)?, &plain.apply(&x, 4)?)? < 1e-5);
    Ok(())
}

#[test]
fn su_scaling_switches_segment_at_original_context() -> Result<()> {
    let device = Device::Cpu;
    let config = RotaryConfig {
        dim: 4,
        scaling: RotaryScaling::Su {
            long_factor: vec![2.0, 4.0],
            short_factor: vec![1.0, 1.0],
        },
        original_max_position_embeddings: 16,
        max_position_embeddings: 64,
        ..RotaryConfig::default()
    };
    let mut rope = RotaryEmbeddings::new(config, 4)?;
    rope.ensure_positions(32, &device)?;
    let (sin, cos) = rope.tables().expect("tables built");
    let sin = sin.to_vec2::<f32>()?;
    let cos = cos.to_vec2::<f32>()?;

    let mscale = (1.0 + (4f64).ln() / (16f64).ln()).sqrt();
    let base = [1.0f64, 0.01];
    for (pos, factors) in [(15usize, [1.0f64, 1.0]), (16, [2.0, 4.0]), (31, [2.0, 4.0])] {
        for i in 0..2 {
            let angle = pos as f64 * base[i] / factors[i];
            assert!((sin[pos][i] as f64 - angle.sin() * mscale).abs() < 1e-5);
            assert!((cos[pos][i] as f64 - angle.cos() * mscale).abs() < 1e-5);
        }
    }
    Ok(())
}

#[test]
fn llama3_scaling_keeps_high_and_divides_low_frequencies() -> Result<()> {
    let head_dim = 64;
    let plain = RotaryEmbeddings::new(RotaryConfig::default(), head_dim)?;
    let scaled = RotaryEmbeddings::new(
        RotaryConfig {
            scaling: RotaryScaling::Llama3 {
                factor: Some(8.0),
                low_freq_factor: 1.0,
                high_freq_factor: 4.0,
            },
            original_max_position_embeddings: 8192,
            ..RotaryConfig::default()
        },
        head_dim,
    )?;
    let base = plain.inv_freq();
    let adjusted = scaled.inv_freq();
    assert_eq!(adjusted[0], base[0]);
    let last = base.len() - 1;
    assert!((adjusted[last] - base[last] / 8.0).abs() < 1e-15);
    // Every adjusted frequency lies between the two extremes.
    for (a, b) in adjusted.iter().zip(base) {
        assert!(*a <= *b * (1.0 + 1e-12) && *a >= b / 8.0 * (1.0 - 1e-12));
    }
    Ok(())
}

#[test]
fn llama3_factor_defaults_to_context_ratio() -> Result<()> {
    let explicit = RotaryEmbeddings::new(
        RotaryConfig {
            scaling: RotaryScaling::Llama3 {
                factor: Some(4.0),
                low_freq_factor: 1.0,
                high_freq_factor: 4.0,
            },
            original_max_position_embeddings: 1024,
            ..RotaryConfig::default()
        },
        32,
    )?;
    let derived = RotaryEmbeddings::new(
        RotaryConfig {
            scaling: RotaryScaling::Llama3 {
                factor: None,
                low_freq_factor: 1.0,
                high_freq_factor: 4.0,
            },
            original_max_position_embeddings: 1024,
            max_position_embeddings: 4096,
            ..RotaryConfig::default()
        },
        32,
    )?;
    assert_eq!(explicit.inv_freq(), derived.inv_freq());
    Ok(())
}

#[test]
fn output_keeps_input_dtype() -> Result<()> {
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (1, 2, 3, 8), &device)?;
    let mut rope = RotaryEmbeddings::new(RotaryConfig::default(), 8)?;
    let reference = rope.apply(&x, 2)?;
    for dtype in [DType::BF16, DType::F16] {
        let out = rope.apply(&x.to_dtype(dtype)?, 2)?;
        assert_eq!(out.dtype(), dtype);
        assert!(max_abs_diff(&out, &reference)? < 5e-2);
    }
    Ok(())
}

#[test]
fn invalid_configurations_are_rejected() {
    assert!(RotaryEmbeddings::new(RotaryConfig::default(), 7).is_err());
    assert!(RotaryEmbeddings::new(
        RotaryConfig {
            dim: 16,
            ..RotaryConfig::default()
        },
        8
    )
    .is_err());
    assert!(RotaryEmbeddings::new(
        RotaryConfig {
            scaling: RotaryScaling::Su {
                long_factor: vec![1.0],
                short_factor: vec![1.0],
            },
            original_max_position_embeddings: 16,
            ..RotaryConfig::default()
        },
        8
    )
    .is_err());
}

#[test]
fn config_reads_tagged_scaling_from_json() -> serde_json::Result<()> {
    let config: RotaryConfig = serde_json::from_str(
        r#"{"dim": 32, "interleave": false, "scaling": {"type": "llama3", "factor": 8.0}}"#,
    )?;
    assert_eq!(config.dim, 32);
    assert!(!config.interleave);
    assert_eq!(config.base, 10_000.0);
    assert_eq!(
        config.scaling,
        RotaryScaling::Llama3 {
            factor: Some(8.0),
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
        }
    );
    Ok(())
}
