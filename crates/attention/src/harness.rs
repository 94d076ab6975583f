//! Comparison driver for fused attention kernels.
//!
//! A case samples one `(query, key, value)` triple from a fixed seed, feeds two
//! independent copies through the fused kernel and the reference evaluator,
//! runs backward on both outputs and requires the forward results and all
//! three input gradients to agree within the case tolerance.
//!
//! Suites are loaded from TOML:
//!
//! ```toml
//! seed = 2023
//!
//! [[cases]]
//! precision = "float16"
//! shape = [1, 128, 2, 32]
//! rtol = 5e-3
//! atol = 5e-3
//! ```
//!
//! Omitted fields fall back to [`CaseConfig::new`] for the case precision.

use std::{env, fs, path::Path};

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

use crate::capability::{check, Capability, DeviceProbe};
use crate::compare::{assert_allclose, diff_stats, expect_shape, DiffStats};
use crate::core::{CheckError, Config, FlashAttention, Precision, Tolerance};
use crate::reference::attention_naive;

/// `(batch, seq_len, num_heads, head_dim)` used when a case does not say otherwise.
pub const DEFAULT_SHAPE: [usize; 4] = [1, 128, 2, 32];
pub const DEFAULT_SEED: u64 = 2023;

/// Environment variable overriding the seed of every case in a suite.
pub const SEED_ENV: &str = "ATTN_CHECK_SEED";

/// One comparison run.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseConfig {
    pub name: String,
    pub precision: Precision,
    pub shape: [usize; 4],
    pub seed: u64,
    pub dropout_p: f32,
    pub causal: bool,
    pub return_softmax: bool,
    pub rtol: f64,
    pub atol: f64,
}

impl CaseConfig {
    /// The standard causal case for `precision` with its default tolerance.
    pub fn new(precision: Precision) -> Self {
        let tol = precision.tolerance();
        Self {
            name: format!("flash_attention_{precision}"),
            precision,
            shape: DEFAULT_SHAPE,
            seed: DEFAULT_SEED,
            dropout_p: 0.0,
            causal: true,
            return_softmax: false,
            rtol: tol.rtol,
            atol: tol.atol,
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance::new(self.rtol, self.atol)
    }

    /// Kernel configuration handed to the fused path.
    pub fn attention_config(&self) -> Config {
        Config {
            dropout_p: Some(self.dropout_p),
            causal: self.causal,
            return_softmax: self.return_softmax,
        }
    }

    pub fn validate(&self) -> Result<(), CheckError> {
        if self.shape.iter().any(|dim| *dim == 0) {
            return Err(CheckError::InvalidCase(format!(
                "{}: every dimension of {:?} must be non-zero",
                self.name, self.shape
            )));
        }
        if self.dropout_p != 0.0 {
            return Err(CheckError::InvalidCase(format!(
                "{}: dropout_p={} makes the fused output random; comparisons need 0.0",
                self.name, self.dropout_p
            )));
        }
        if !(self.rtol >= 0.0 && self.atol >= 0.0) {
            return Err(CheckError::InvalidCase(format!(
                "{}: tolerances must be non-negative (rtol={}, atol={})",
                self.name, self.rtol, self.atol
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaseFile {
    name: Option<String>,
    precision: Precision,
    shape: Option<[usize; 4]>,
    seed: Option<u64>,
    dropout_p: Option<f32>,
    causal: Option<bool>,
    return_softmax: Option<bool>,
    rtol: Option<f64>,
    atol: Option<f64>,
}

impl CaseFile {
    fn resolve(self, suite_seed: Option<u64>) -> CaseConfig {
        let base = CaseConfig::new(self.precision);
        CaseConfig {
            name: self.name.unwrap_or(base.name),
            precision: self.precision,
            shape: self.shape.unwrap_or(base.shape),
            seed: self.seed.or(suite_seed).unwrap_or(base.seed),
            dropout_p: self.dropout_p.unwrap_or(base.dropout_p),
            causal: self.causal.unwrap_or(base.causal),
            return_softmax: self.return_softmax.unwrap_or(base.return_softmax),
            rtol: self.rtol.unwrap_or(base.rtol),
            atol: self.atol.unwrap_or(base.atol),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SuiteFile {
    seed: Option<u64>,
    #[serde(default)]
    cases: Vec<CaseFile>,
}

/// Ordered list of cases; each one runs independently.
#[derive(Debug, Clone, PartialEq)]
pub struct SuiteConfig {
    pub cases: Vec<CaseConfig>,
}

impl Default for SuiteConfig {
    /// One case per precision: `float32`, `float16`, `bfloat16`.
    fn default() -> Self {
        Self {
            cases: Precision::ALL.into_iter().map(CaseConfig::new).collect(),
        }
    }
}

impl SuiteConfig {
    /// Parse a suite; an empty `cases` list yields the default suite with the
    /// file-level seed applied.
    pub fn from_toml_str(contents: &str) -> Result<Self, CheckError> {
        let file: SuiteFile = toml::from_str(contents)?;
        let suite = if file.cases.is_empty() {
            let mut suite = Self::default();
            if let Some(seed) = file.seed {
                suite = suite.with_seed(seed);
            }
            suite
        } else {
            let seed = file.seed;
            Self {
                cases: file.cases.into_iter().map(|case| case.resolve(seed)).collect(),
            }
        };
        suite.validate()?;
        Ok(suite)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CheckError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        for case in self.cases.iter_mut() {
            case.seed = seed;
        }
        self
    }

    /// Keep only cases whose precision is listed. An empty list keeps everything.
    pub fn retain_precisions(mut self, precisions: &[Precision]) -> Self {
        if !precisions.is_empty() {
            self.cases.retain(|case| precisions.contains(&case.precision));
        }
        self
    }

    pub fn apply_env_overrides(self) -> Result<Self, CheckError> {
        match env::var(SEED_ENV) {
            Ok(value) => {
                let seed = value.trim().parse::<u64>().map_err(|_| {
                    CheckError::InvalidCase(format!("{SEED_ENV} must be an unsigned integer, got '{value}'"))
                })?;
                log::info!("{SEED_ENV} overrides the seed of every case with {seed}");
                Ok(self.with_seed(seed))
            }
            Err(_) => Ok(self),
        }
    }

    pub fn validate(&self) -> Result<(), CheckError> {
        if self.cases.is_empty() {
            return Err(CheckError::InvalidCase("suite has no cases".to_string()));
        }
        self.cases.iter().try_for_each(CaseConfig::validate)
    }
}

/// Sample query, key and value (in that order) uniformly from `[0, 1)`.
pub fn sample_qkv(shape: [usize; 4], seed: u64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = shape.iter().product::<usize>();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut draw = || (0..n).map(|_| rng.gen::<f64>()).collect::<Vec<f64>>();
    let query = draw();
    let key = draw();
    let value = draw();
    (query, key, value)
}

/// One `(q, k, v)` triple wrapped as gradient-tracking variables.
struct QkvVars {
    q: Var,
    k: Var,
    v: Var,
}

impl QkvVars {
    fn new(
        (query, key, value): (&[f64], &[f64], &[f64]),
        case: &CaseConfig,
        device: &Device,
    ) -> Result<Self, CheckError> {
        let [b, s, h, d] = case.shape;
        let dtype = case.precision.dtype();
        let wrap = |data: &[f64]| -> Result<Var, CheckError> {
            let tensor = Tensor::from_slice(data, (b, s, h, d), device)?.to_dtype(dtype)?;
            Ok(Var::from_tensor(&tensor)?)
        };
        Ok(Self {
            q: wrap(query)?,
            k: wrap(key)?,
            v: wrap(value)?,
        })
    }

    fn tensors(&self) -> (&Tensor, &Tensor, &Tensor) {
        (self.q.as_tensor(), self.k.as_tensor(), self.v.as_tensor())
    }

    /// Gradients of q, k, v, each checked against the input shape.
    fn gradients(&self, grads: &GradStore, path: &str) -> Result<[Tensor; 3], CheckError> {
        let lookup = |name: &str, var: &Var| -> Result<Tensor, CheckError> {
            let what = format!("{path} {name} grad");
            let grad = grads
                .get(var.as_tensor())
                .cloned()
                .ok_or_else(|| CheckError::MissingGradient { what: what.clone() })?;
            expect_shape(&what, &grad, var.dims())?;
            Ok(grad)
        };
        Ok([lookup("q", &self.q)?, lookup("k", &self.k)?, lookup("v", &self.v)?])
    }
}

/// Diff statistics of a passing case.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseReport {
    pub name: String,
    pub precision: Precision,
    pub shape: [usize; 4],
    pub forward: DiffStats,
    pub grad_q: DiffStats,
    pub grad_k: DiffStats,
    pub grad_v: DiffStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Passed(CaseReport),
    /// The capability gate rejected the device; nothing was computed.
    Skipped { reason: String },
}

/// Run one case of `kernel` against the reference.
///
/// Returns `Ok(Outcome::Skipped)` when `probe` does not satisfy the kernel's
/// requirement, `Ok(Outcome::Passed)` when every check holds and the first
/// failing check as an error otherwise.
pub fn run_case(
    kernel: &dyn FlashAttention,
    probe: &dyn DeviceProbe,
    device: &Device,
    case: &CaseConfig,
) -> Result<Outcome, CheckError> {
    if let Capability::Unsupported { reason } = check(probe, &kernel.requirement()) {
        log::info!("{} skipped: {reason}", case.name);
        return Ok(Outcome::Skipped { reason });
    }
    case.validate()?;
    log::info!(
        "{}: kernel={} shape={:?} dtype={}",
        case.name,
        kernel.name(),
        case.shape,
        case.precision
    );

    let (query, key, value) = sample_qkv(case.shape, case.seed);
    let samples = (query.as_slice(), key.as_slice(), value.as_slice());
    let fused = QkvVars::new(samples, case, device)?;
    let reference = QkvVars::new(samples, case, device)?;

    let (q, k, v) = fused.tensors();
    let (out, _softmax) = kernel.flash_attention(q, k, v, &case.attention_config())?;
    let (q_ref, k_ref, v_ref) = reference.tensors();
    let out_ref = attention_naive(q_ref, k_ref, v_ref, case.causal)?;

    let grads = out.backward()?;
    let grads_ref = out_ref.backward()?;

    let tol = case.tolerance();
    let forward = assert_allclose("forward output", &out, &out_ref, tol)?;

    let fused_grads = fused.gradients(&grads, "fused")?;
    let reference_grads = reference.gradients(&grads_ref, "reference")?;

    let names = ["q", "k", "v"];
    for (name, (got, want)) in names.iter().zip(fused_grads.iter().zip(&reference_grads)) {
        let stats = diff_stats(name, got, want)?;
        log::info!("max_diff_{name}_grad: {:e}", stats.max_abs);
        log::info!("mean_diff_{name}_grad: {:e}", stats.mean_abs);
    }

    let mut grad_stats = [DiffStats::default(); 3];
    for (slot, (name, (got, want))) in grad_stats
        .iter_mut()
        .zip(names.iter().zip(fused_grads.iter().zip(&reference_grads)))
    {
        *slot = assert_allclose(&format!("{name} grad"), got, want, tol)?;
    }

    Ok(Outcome::Passed(CaseReport {
        name: case.name.clone(),
        precision: case.precision,
        shape: case.shape,
        forward,
        grad_q: grad_stats[0],
        grad_k: grad_stats[1],
        grad_v: grad_stats[2],
    }))
}

#[derive(Debug)]
pub struct CaseResult {
    pub name: String,
    pub precision: Precision,
    pub outcome: Result<Outcome, CheckError>,
}

impl CaseResult {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, Ok(Outcome::Passed(_)))
    }

    pub fn skipped(&self) -> bool {
        matches!(self.outcome, Ok(Outcome::Skipped { .. }))
    }

    pub fn failed(&self) -> bool {
        self.outcome.is_err()
    }
}

#[derive(Debug, Default)]
pub struct SuiteSummary {
    pub results: Vec<CaseResult>,
}

impl SuiteSummary {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.failed()).count()
    }

    /// Process exit code: skips count as success, any failure does not.
    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 {
            0
        } else {
            1
        }
    }
}

/// Run every case of `suite`; a failing case does not stop the ones after it.
pub fn run_suite(
    kernel: &dyn FlashAttention,
    probe: &dyn DeviceProbe,
    device: &Device,
    suite: &SuiteConfig,
) -> SuiteSummary {
    let results = suite
        .cases
        .iter()
        .map(|case| {
            let outcome = run_case(kernel, probe, device, case);
            if let Err(err) = &outcome {
                log::error!("{} failed: {err}", case.name);
            }
            CaseResult {
                name: case.name.clone(),
                precision: case.precision,
                outcome,
            }
        })
        .collect();
    SuiteSummary { results }
}
