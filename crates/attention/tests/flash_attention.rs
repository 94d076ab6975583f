//! End-to-end comparison of the tiled kernel against the exact reference.

use attention::capability::{
    CandleProbe, DeviceGeneration, KernelRequirement, StaticProbe, BUNDLED_LIBRARY_VERSION,
    LIBRARY_NOT_INSTALLED, XPU3_XHPC,
};
use attention::fused::TiledFlashAttention;
use attention::harness::{run_case, run_suite, sample_qkv, CaseConfig, Outcome, SuiteConfig};
use attention::reference::attention_naive;
use attention::{AttentionError, CheckError, Config, FlashAttention, Precision};
use candle_core::{DType, Device, Tensor};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn cpu_probe() -> StaticProbe {
    StaticProbe::new(DeviceGeneration::Cpu, BUNDLED_LIBRARY_VERSION)
}

fn expect_pass(precision: Precision) {
    init_logging();
    let case = CaseConfig::new(precision);
    let outcome = run_case(&TiledFlashAttention::new(), &cpu_probe(), &Device::Cpu, &case)
        .unwrap_or_else(|err| panic!("{precision} case failed: {err}"));
    match outcome {
        Outcome::Passed(report) => {
            assert_eq!(report.precision, precision);
            assert_eq!(report.shape, [1, 128, 2, 32]);
            let tol = precision.tolerance();
            for stats in [report.forward, report.grad_q, report.grad_k, report.grad_v] {
                assert!(stats.max_abs.is_finite());
                assert!(stats.mean_abs <= stats.max_abs);
                assert!((stats.max_abs as f64) < tol.atol + tol.rtol * 8.0);
            }
        }
        Outcome::Skipped { reason } => panic!("{precision} case skipped: {reason}"),
    }
}

#[test]
fn float32_matches_reference() {
    expect_pass(Precision::Float32);
}

#[test]
fn float16_matches_reference() {
    expect_pass(Precision::Float16);
}

#[test]
fn bfloat16_matches_reference() {
    expect_pass(Precision::Bfloat16);
}

#[test]
fn default_suite_passes_on_cpu() {
    init_logging();
    let device = Device::Cpu;
    let summary = run_suite(
        &TiledFlashAttention::new(),
        &CandleProbe::new(device.clone()),
        &device,
        &SuiteConfig::default(),
    );
    assert_eq!(summary.results.len(), 3);
    assert_eq!(summary.failed(), 0);
    assert_eq!(summary.passed() + summary.skipped(), 3);
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn unsupported_device_skips_with_reason() {
    init_logging();
    let kernel = TiledFlashAttention::new().with_requirement(XPU3_XHPC);
    let case = CaseConfig::new(Precision::Float16);

    let outcome = run_case(&kernel, &cpu_probe(), &Device::Cpu, &case).unwrap();
    assert_eq!(
        outcome,
        Outcome::Skipped {
            reason: "only available on XPU3 with XHPC".to_string()
        }
    );

    let missing_library = StaticProbe::new(DeviceGeneration::Xpu3, LIBRARY_NOT_INSTALLED);
    let outcome = run_case(&kernel, &missing_library, &Device::Cpu, &case).unwrap();
    assert!(matches!(outcome, Outcome::Skipped { .. }));

    let older_part = StaticProbe::new(DeviceGeneration::Xpu2, "xhpc-2.1");
    let summary = run_suite(&kernel, &older_part, &Device::Cpu, &SuiteConfig::default());
    assert_eq!(summary.skipped(), 3);
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn supported_generation_runs_the_comparison() {
    init_logging();
    let kernel = TiledFlashAttention::new().with_requirement(XPU3_XHPC);
    let probe = StaticProbe::new(DeviceGeneration::Xpu3, "xhpc-2.1");
    let case = CaseConfig::new(Precision::Float32);
    let outcome = run_case(&kernel, &probe, &Device::Cpu, &case).unwrap();
    assert!(matches!(outcome, Outcome::Passed(_)));
}

#[test]
fn block_size_does_not_change_the_verdict() {
    init_logging();
    let mut case = CaseConfig::new(Precision::Float32);
    case.shape = [2, 37, 3, 16];
    case.seed = 11;
    for block in [1, 7, 64] {
        let kernel = TiledFlashAttention::new().with_block_size(block);
        let outcome = run_case(&kernel, &cpu_probe(), &Device::Cpu, &case).unwrap();
        assert!(matches!(outcome, Outcome::Passed(_)), "block size {block}");
    }
}

#[test]
fn non_causal_case_passes() {
    init_logging();
    let mut case = CaseConfig::new(Precision::Float32);
    case.causal = false;
    case.shape = [1, 48, 2, 16];
    let outcome = run_case(&TiledFlashAttention::new(), &cpu_probe(), &Device::Cpu, &case).unwrap();
    assert!(matches!(outcome, Outcome::Passed(_)));
}

/// Doubles the output of the tiled kernel.
struct ScaledOutput;

impl FlashAttention for ScaledOutput {
    fn name(&self) -> &'static str {
        "scaled"
    }

    fn requirement(&self) -> KernelRequirement {
        TiledFlashAttention::new().requirement()
    }

    fn flash_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<(Tensor, Option<Tensor>), AttentionError> {
        let (out, softmax) = TiledFlashAttention::new().flash_attention(q, k, v, config)?;
        Ok((out.affine(2.0, 0.0)?, softmax))
    }
}

/// Returns the right values but cuts the autodiff graph.
struct Detached;

impl FlashAttention for Detached {
    fn name(&self) -> &'static str {
        "detached"
    }

    fn requirement(&self) -> KernelRequirement {
        TiledFlashAttention::new().requirement()
    }

    fn flash_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<(Tensor, Option<Tensor>), AttentionError> {
        let (out, softmax) = TiledFlashAttention::new().flash_attention(q, k, v, config)?;
        let values = out.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let rebuilt = Tensor::from_vec(values, out.dims(), out.device())?.to_dtype(out.dtype())?;
        Ok((rebuilt, softmax))
    }
}

#[test]
fn wrong_output_is_reported() {
    init_logging();
    let case = CaseConfig::new(Precision::Float32);
    let err = run_case(&ScaledOutput, &cpu_probe(), &Device::Cpu, &case).unwrap_err();
    match err {
        CheckError::NotClose {
            what,
            mismatched,
            total,
            ..
        } => {
            assert_eq!(what, "forward output");
            assert!(mismatched > 0);
            assert_eq!(total, 128 * 2 * 32);
        }
        other => panic!("expected NotClose, got {other}"),
    }
}

#[test]
fn missing_gradient_is_reported() {
    init_logging();
    let case = CaseConfig::new(Precision::Float32);
    let err = run_case(&Detached, &cpu_probe(), &Device::Cpu, &case).unwrap_err();
    assert!(matches!(err, CheckError::MissingGradient { .. }), "{err}");
}

#[test]
fn suite_continues_after_failures() {
    init_logging();
    let summary = run_suite(&ScaledOutput, &cpu_probe(), &Device::Cpu, &SuiteConfig::default());
    assert_eq!(summary.results.len(), 3);
    assert_eq!(summary.failed(), 3);
    assert_eq!(summary.exit_code(), 1);
    let precisions: Vec<_> = summary.results.iter().map(|r| r.precision).collect();
    assert_eq!(precisions, Precision::ALL.to_vec());
}

#[test]
fn suite_file_round_trips_through_disk() {
    init_logging();
    let path = std::env::temp_dir().join(format!("attn-check-suite-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
        [[cases]]
        name = "small-bf16"
        precision = "bfloat16"
        shape = [1, 16, 2, 8]
        "#,
    )
    .unwrap();
    let suite = SuiteConfig::from_path(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(suite.cases.len(), 1);
    assert_eq!(suite.cases[0].precision, Precision::Bfloat16);
    let summary = run_suite(&TiledFlashAttention::new(), &cpu_probe(), &Device::Cpu, &suite);
    assert_eq!(summary.passed(), 1);

    let missing = SuiteConfig::from_path(std::env::temp_dir().join("attn-check-no-such-suite.toml"));
    assert!(matches!(missing, Err(CheckError::Io(_))));
}

fn sampled(shape: [usize; 4], seed: u64) -> (Tensor, Tensor, Tensor) {
    let (q, k, v) = sample_qkv(shape, seed);
    let dims = (shape[0], shape[1], shape[2], shape[3]);
    let device = Device::Cpu;
    let to_tensor = |data: Vec<f64>| {
        Tensor::from_vec(data, dims, &device)
            .and_then(|t| t.to_dtype(DType::F32))
            .unwrap()
    };
    (to_tensor(q), to_tensor(k), to_tensor(v))
}

/// Nested `[batch][seq][head][dim]` view of a rank-4 tensor.
fn rows(tensor: &Tensor) -> Vec<Vec<Vec<Vec<f32>>>> {
    let (_, seq_len, heads, head_dim) = tensor.dims4().unwrap();
    let flat = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .unwrap();
    flat.chunks(seq_len * heads * head_dim)
        .map(|batch| {
            batch
                .chunks(heads * head_dim)
                .map(|position| position.chunks(head_dim).map(<[f32]>::to_vec).collect())
                .collect()
        })
        .collect()
}

#[test]
fn nested_view_follows_row_major_layout() {
    let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
    let tensor = Tensor::from_vec(data, (2, 3, 2, 2), &Device::Cpu).unwrap();
    let view = rows(&tensor);
    assert_eq!(view.len(), 2);
    assert_eq!(view[0].len(), 3);
    assert_eq!(view[0][0], vec![vec![0.0, 1.0], vec![2.0, 3.0]]);
    assert_eq!(view[1][2][1], vec![22.0, 23.0]);
}

#[test]
fn reference_ignores_future_positions() {
    let shape = [1, 12, 2, 4];
    let (q, k, v) = sampled(shape, 5);
    let base = rows(&attention_naive(&q, &k, &v, true).unwrap());

    let cut = 6;
    let mut k_data = rows(&k);
    let mut v_data = rows(&v);
    for s in cut + 1..shape[1] {
        for h in 0..shape[2] {
            for d in 0..shape[3] {
                k_data[0][s][h][d] += 3.0;
                v_data[0][s][h][d] -= 2.0;
            }
        }
    }
    let flatten = |data: Vec<Vec<Vec<Vec<f32>>>>| {
        let flat: Vec<f32> = data.into_iter().flatten().flatten().flatten().collect();
        Tensor::from_vec(flat, (shape[0], shape[1], shape[2], shape[3]), &Device::Cpu).unwrap()
    };
    let perturbed =
        rows(&attention_naive(&q, &flatten(k_data), &flatten(v_data), true).unwrap());

    for s in 0..=cut {
        assert_eq!(base[0][s], perturbed[0][s], "position {s}");
    }
    assert_ne!(base[0][shape[1] - 1], perturbed[0][shape[1] - 1]);
}

#[test]
fn reference_outputs_are_convex_combinations() {
    let shape = [2, 10, 3, 5];
    let (q, k, v) = sampled(shape, 17);
    let out = rows(&attention_naive(&q, &k, &v, true).unwrap());
    let v = rows(&v);
    for b in 0..shape[0] {
        for s in 0..shape[1] {
            for h in 0..shape[2] {
                for d in 0..shape[3] {
                    let visible = (0..=s).map(|j| v[b][j][h][d]);
                    let lo = visible.clone().fold(f32::INFINITY, f32::min);
                    let hi = visible.fold(f32::NEG_INFINITY, f32::max);
                    let x = out[b][s][h][d];
                    assert!(x >= lo - 1e-5 && x <= hi + 1e-5, "b={b} s={s} h={h} d={d}");
                }
            }
        }
    }
    // The first query only sees the first key.
    for h in 0..shape[2] {
        for d in 0..shape[3] {
            assert!((out[0][0][h][d] - v[0][0][h][d]).abs() < 1e-6);
        }
    }
}

#[test]
fn reference_is_deterministic() {
    let (q, k, v) = sampled([1, 16, 2, 8], 2023);
    let a = rows(&attention_naive(&q, &k, &v, true).unwrap());
    let b = rows(&attention_naive(&q, &k, &v, true).unwrap());
    assert_eq!(a, b);
}

#[test]
fn sampling_reproduces_for_a_seed() {
    let a = sample_qkv([1, 8, 2, 4], 2023);
    let b = sample_qkv([1, 8, 2, 4], 2023);
    assert_eq!(a, b);
}
