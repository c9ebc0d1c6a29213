use std::sync::Arc;
use std::thread;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use layers::dense::{Dense, DenseOptions};
use layers::parallel::{Communicator, LocalCommunicator};
use layers::quantize::{self, IntWidth, QuantMethod, QuantizationConfig, ScalePolicy};
use layers::store::MemoryWeightStore;

fn relative_error(actual: &Tensor, expected: &Tensor) -> Result<f32> {
    let diff = actual.sub(expected)?.sqr()?.sum_all()?.sqrt()?.to_vec0::<f32>()?;
    let norm = expected.sqr()?.sum_all()?.sqrt()?.to_vec0::<f32>()?;
    Ok(diff / norm)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()?)
}

#[test]
fn low_rank_output_equals_direct_factorised_product() -> Result<()> {
    let device = Device::Cpu;
    let w1 = Tensor::randn(0f32, 0.3, (16, 4), &device)?;
    let w2 = Tensor::randn(0f32, 0.3, (4, 12), &device)?;
    let bias = Tensor::randn(0f32, 0.1, 12, &device)?;
    let store = MemoryWeightStore::new()
        .with("proj/low_rank_weight_1", w1.clone())
        .with("proj/low_rank_weight_2", w2.clone())
        .with("proj/bias", bias.clone());
    let dense = Dense::new(&store, "proj", DenseOptions::default())?;
    assert_eq!(dense.weights().kind(), "low_rank");

    let x = Tensor::randn(0f32, 1.0, (5, 16), &device)?;
    let expected = x.matmul(&w1)?.matmul(&w2)?.broadcast_add(&bias)?;
    assert_eq!(max_abs_diff(&dense.forward(&x)?, &expected)?, 0.0);
    Ok(())
}

fn quantized_store(weight: &Tensor, bias: &Tensor, cfg: &QuantizationConfig) -> Result<MemoryWeightStore> {
    let weight_cfg = QuantizationConfig {
        shift_to_uint8: false,
        ..cfg.clone()
    };
    let q = quantize::quantize(weight, &weight_cfg)?;
    let mut store = MemoryWeightStore::new()
        .with("proj/weight", q.values.clone())
        .with("proj/weight_scale", q.scales.clone())
        .with("proj/bias", bias.clone());
    if cfg.shift_to_uint8 {
        store.insert(
            "proj/weight_compensation",
            quantize::shift_compensation(&q.values)?,
        );
    }
    Ok(store)
}

#[test]
fn quantized_paths_track_float_output() -> Result<()> {
    let device = Device::Cpu;
    let weight = Tensor::randn(0f32, 0.2, (48, 64), &device)?;
    let bias = Tensor::randn(0f32, 0.1, 48, &device)?;
    let x = Tensor::randn(0f32, 1.0, (2, 8, 64), &device)?;
    let reference = x
        .reshape((16, 64))?
        .matmul(&weight.t()?)?
        .broadcast_add(&bias)?
        .reshape((2, 8, 48))?;

    let cases = [
        (QuantizationConfig::default(), 2e-2),
        (
            QuantizationConfig {
                shift_to_uint8: true,
                ..QuantizationConfig::default()
            },
            2e-2,
        ),
        (
            QuantizationConfig {
                width: IntWidth::Int16,
                ..QuantizationConfig::default()
            },
            1e-3,
        ),
    ];
    for (cfg, tol) in cases {
        let store = quantized_store(&weight, &bias, &cfg)?;
        let options = DenseOptions {
            quantization: cfg.clone(),
            ..DenseOptions::default()
        };
        let dense = Dense::new(&store, "proj", options)?;
        let out = dense.forward(&x)?;
        assert_eq!(out.dims(), &[2, 8, 48]);
        let err = relative_error(&out, &reference)?;
        assert!(err < tol, "{cfg:?}: relative error {err}");
    }
    Ok(())
}

#[test]
fn shift_without_compensation_is_missing_weight() -> Result<()> {
    let device = Device::Cpu;
    let weight = Tensor::randn(0f32, 0.2, (4, 8), &device)?;
    let q = quantize::quantize(&weight, &QuantizationConfig::default())?;
    let store = MemoryWeightStore::new()
        .with("proj/weight", q.values)
        .with("proj/weight_scale", q.scales);
    let options = DenseOptions {
        quantization: QuantizationConfig {
            shift_to_uint8: true,
            ..QuantizationConfig::default()
        },
        ..DenseOptions::default()
    };
    let err = Dense::new(&store, "proj", options).unwrap_err();
    assert!(err.to_string().contains("weight_compensation"));
    Ok(())
}

#[test]
fn compensation_is_ignored_without_shift() -> Result<()> {
    let device = Device::Cpu;
    let weight = Tensor::randn(0f32, 0.2, (6, 16), &device)?;
    let bias = Tensor::zeros(6, DType::F32, &device)?;
    let x = Tensor::randn(0f32, 1.0, (3, 16), &device)?;
    let cfg = QuantizationConfig::default();

    let plain = quantized_store(&weight, &bias, &cfg)?;
    let mut with_compensation = quantized_store(&weight, &bias, &cfg)?;
    let q = quantize::quantize(&weight, &cfg)?;
    with_compensation.insert(
        "proj/weight_compensation",
        quantize::shift_compensation(&q.values)?,
    );

    let options = || DenseOptions {
        quantization: cfg.clone(),
        ..DenseOptions::default()
    };
    let expected = Dense::new(&plain, "proj", options())?.forward(&x)?;
    let actual = Dense::new(&with_compensation, "proj", options())?.forward(&x)?;
    assert_eq!(max_abs_diff(&actual, &expected)?, 0.0);
    Ok(())
}

#[test]
fn global_scale_is_rejected_for_int8() -> Result<()> {
    let device = Device::Cpu;
    let weight = Tensor::randn(0f32, 0.2, (4, 8), &device)?;
    let bias = Tensor::zeros(4, DType::F32, &device)?;
    let store = quantized_store(&weight, &bias, &QuantizationConfig::default())?;
    let options = DenseOptions {
        quantization: QuantizationConfig {
            scale_policy: ScalePolicy::Global,
            ..QuantizationConfig::default()
        },
        ..DenseOptions::default()
    };
    let err = Dense::new(&store, "proj", options).unwrap_err();
    assert!(err.to_string().contains("int16"), "{err}");
    Ok(())
}

fn affine_store(device: &Device) -> Result<(MemoryWeightStore, Tensor)> {
    let (in_features, out_features, group) = (32usize, 16usize, 16usize);
    let groups = in_features / group;
    let q: Vec<u8> = (0..in_features * out_features)
        .map(|i| ((i * 11 + 3) % 16) as u8)
        .collect();
    let z: Vec<u8> = (0..groups * out_features).map(|i| (7 + i % 3) as u8).collect();
    let qweight = quantize::pack_int4(&q, in_features, out_features, device)?;
    let zeros = quantize::pack_int4(&z, groups, out_features, device)?;
    let scales = Tensor::rand(0.01f32, 0.05, (groups, out_features), device)?;
    let dense = quantize::affine_dequantize(&qweight, &scales, &zeros)?;
    let store = MemoryWeightStore::new()
        .with("proj/weight", qweight)
        .with("proj/weight_scale", scales)
        .with("proj/weight_zero", zeros);
    Ok((store, dense))
}

#[test]
fn affine_kernels_switch_on_row_threshold() -> Result<()> {
    let device = Device::Cpu;
    let (store, dense_weight) = affine_store(&device)?;
    let mut cfg = QuantizationConfig::affine(QuantMethod::AwqGemm);
    cfg.affine_gemm_min_rows = 6;
    let gemm = Dense::new(
        &store,
        "proj",
        DenseOptions {
            quantization: cfg,
            ..DenseOptions::default()
        },
    )?;
    let gemv = Dense::new(
        &store,
        "proj",
        DenseOptions {
            quantization: QuantizationConfig::affine(QuantMethod::AwqGemv),
            ..DenseOptions::default()
        },
    )?;

    // Below and above the threshold of 6 rows.
    for (batch, seq) in [(1usize, 2usize), (2, 4)] {
        let x = Tensor::randn(0f32, 1.0, (batch, seq, 32), &device)?;
        let expected = x
            .reshape((batch * seq, 32))?
            .matmul(&dense_weight)?
            .reshape((batch, seq, 16))?;
        assert!(max_abs_diff(&gemm.forward(&x)?, &expected)? < 1e-4);
        assert!(max_abs_diff(&gemv.forward(&x)?, &expected)? < 1e-4);
    }
    Ok(())
}

#[test]
fn affine_weights_reject_selection() -> Result<()> {
    let device = Device::Cpu;
    let (store, _) = affine_store(&device)?;
    let dense = Dense::new(
        &store,
        "proj",
        DenseOptions {
            quantization: QuantizationConfig::affine(QuantMethod::AwqGemv),
            ..DenseOptions::default()
        },
    )?;
    let index = Tensor::new(&[0u32, 1], &device)?;
    assert!(dense.select_weights(Some(&index), None).is_err());
    Ok(())
}

/// Runs one row-parallel output projection per rank and returns each rank's
/// reduced output.
fn run_row_parallel(
    world_size: usize,
    stores: Vec<MemoryWeightStore>,
    quantization: QuantizationConfig,
    x: Tensor,
) -> Result<Vec<Tensor>> {
    let shard = x.dim(1)? / world_size;
    let handles: Vec<_> = LocalCommunicator::group(world_size)
        .into_iter()
        .zip(stores)
        .map(|(comm, store)| {
            let quantization = quantization.clone();
            let x = x.clone();
            thread::spawn(move || -> Result<Tensor> {
                let rank = comm.rank();
                let comm: Arc<dyn Communicator> = Arc::new(comm);
                let options = DenseOptions {
                    is_layer_out: true,
                    quantization,
                    communicator: comm.clone(),
                    ..DenseOptions::default()
                };
                let dense = Dense::new(&store, "proj", options)?;
                let local = dense.forward(&x.narrow(1, rank * shard, shard)?)?;
                Ok(comm.all_reduce_sum(&local)?)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank panicked"))
        .collect()
}

#[test]
fn bias_is_added_once_across_ranks() -> Result<()> {
    let device = Device::Cpu;
    let world_size = 2;
    let weight = Tensor::randn(0f32, 0.3, (6, 8), &device)?;
    let bias = Tensor::new(&[1f32, 2.0, 3.0, 4.0, 5.0, 6.0], &device)?;
    let x = Tensor::randn(0f32, 1.0, (3, 8), &device)?;
    let reference = x.matmul(&weight.t()?)?.broadcast_add(&bias)?;

    let stores = (0..world_size)
        .map(|rank| -> Result<MemoryWeightStore> {
            Ok(MemoryWeightStore::new()
                .with("proj/weight", weight.narrow(1, rank * 4, 4)?.contiguous()?)
                .with("proj/bias", bias.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    for reduced in run_row_parallel(world_size, stores, QuantizationConfig::default(), x)? {
        assert!(max_abs_diff(&reduced, &reference)? < 1e-5);
    }
    Ok(())
}

#[test]
fn sharded_quantized_projection_matches_single_rank() -> Result<()> {
    let device = Device::Cpu;
    let world_size = 2;
    let cfg = QuantizationConfig::default();
    let weight = Tensor::randn(0f32, 0.3, (6, 8), &device)?;
    let bias = Tensor::randn(0f32, 0.1, 6, &device)?;
    // Scales are large on one half of the features only, so a per-shard
    // input scale would differ from the full-row one.
    let x = Tensor::randn(0f32, 1.0, (3, 8), &device)?
        .broadcast_mul(&Tensor::new(&[10f32, 10.0, 10.0, 10.0, 0.1, 0.1, 0.1, 0.1], &device)?)?;

    let q = quantize::quantize(&weight, &cfg)?;
    let full_store = MemoryWeightStore::new()
        .with("proj/weight", q.values.clone())
        .with("proj/weight_scale", q.scales.clone())
        .with("proj/bias", bias.clone());
    let single = Dense::new(&full_store, "proj", DenseOptions::default())?.forward(&x)?;

    let stores = (0..world_size)
        .map(|rank| -> Result<MemoryWeightStore> {
            Ok(MemoryWeightStore::new()
                .with("proj/weight", q.values.narrow(1, rank * 4, 4)?.contiguous()?)
                .with("proj/weight_scale", q.scales.clone())
                .with("proj/bias", bias.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    for reduced in run_row_parallel(world_size, stores, cfg.clone(), x)? {
        assert!(max_abs_diff(&reduced, &single)? < 1e-4);
    }
    Ok(())
}

#[test]
fn store_loads_from_safetensors() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("weights.safetensors");
    let weight = Tensor::randn(0f32, 1.0, (3, 2), &device)?;
    MemoryWeightStore::new()
        .with("proj/weight", weight.clone())
        .save_safetensors(&path)?;

    let store = MemoryWeightStore::from_safetensors(&path, &device)?;
    assert_eq!(store.names(), vec!["proj/weight"]);
    let dense = Dense::new(&store, "proj", DenseOptions::default())?;
    let x = Tensor::ones((1, 2), DType::F32, &device)?;
    let expected = x.matmul(&weight.t()?)?;
    assert!(max_abs_diff(&dense.forward(&x)?, &expected)? < 1e-6);
    Ok(())
}
