use std::path::PathBuf;

use anyhow::{Context, Result};
use attention::{
    capability::{CandleProbe, XPU3_XHPC},
    fused::TiledFlashAttention,
    harness::{run_suite, SuiteConfig},
    report::summary_table,
    Precision,
};
use candle_core::Device;
use clap::Parser;

/// Exit code for a suite that could not be loaded or validated.
const SETUP_FAILURE: i32 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Compare fused flash attention against the exact reference", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "TOML suite file; defaults to one case per precision")]
    config: Option<PathBuf>,

    #[arg(
        short,
        long,
        value_name = "PRECISION",
        help = "Only run cases of this precision (float32, float16, bfloat16); repeatable"
    )]
    precision: Vec<Precision>,

    #[arg(long, value_name = "N", help = "Seed for every case, overriding the suite file and ATTN_CHECK_SEED")]
    seed: Option<u64>,

    #[arg(long, help = "Gate the fused kernel on an XPU3 device with XHPC installed")]
    require_xpu3: bool,

    #[arg(long, value_name = "KEYS", default_value_t = attention::fused::DEFAULT_BLOCK_K, help = "Keys per tile in the fused kernel")]
    block_size: usize,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    std::process::exit(exit_code(run(&Args::parse())));
}

/// 0 when every case passed or was skipped, 1 when a case failed and
/// [`SETUP_FAILURE`] when the suite never ran.
fn exit_code(result: Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("attn-check failed: {err:#}");
            SETUP_FAILURE
        }
    }
}

/// Resolve the suite: file (or default), then `ATTN_CHECK_SEED`, then
/// `--precision` and `--seed`.
fn load_suite(args: &Args) -> Result<SuiteConfig> {
    let suite = match &args.config {
        Some(path) => SuiteConfig::from_path(path)
            .with_context(|| format!("loading suite from {}", path.display()))?,
        None => SuiteConfig::default(),
    };
    let mut suite = suite.apply_env_overrides()?.retain_precisions(&args.precision);
    if let Some(seed) = args.seed {
        suite = suite.with_seed(seed);
    }
    suite.validate().context("no cases left to run")?;
    Ok(suite)
}

fn run(args: &Args) -> Result<i32> {
    let suite = load_suite(args)?;

    let mut kernel = TiledFlashAttention::new().with_block_size(args.block_size);
    if args.require_xpu3 {
        kernel = kernel.with_requirement(XPU3_XHPC);
    }

    let device = Device::Cpu;
    let probe = CandleProbe::new(device.clone());
    log::info!("running {} case(s) on {:?}", suite.cases.len(), device.location());

    let summary = run_suite(&kernel, &probe, &device, &suite);
    println!("{}", summary_table(&summary));
    Ok(summary.exit_code())
}
