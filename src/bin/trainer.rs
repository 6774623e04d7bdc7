use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use cascadetrain::trainers::CascadeRun;
use cascadetrain::{core, load_config, ExecutionContext};

#[derive(Parser)]
#[command(name = "trainer", about = "Cascade diffusion training driver")]
struct Args {
    /// Path to the YAML run configuration
    config: PathBuf,

    /// Accelerator index. Falls back to the LOCAL_RANK environment
    /// variable when launched by a cluster scheduler, then to 0.
    #[arg(long)]
    device_index: Option<usize>,
}

fn device_index(args: &Args) -> usize {
    args.device_index
        .or_else(|| std::env::var("LOCAL_RANK").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(0)
}

fn main() -> Result<()> {
    cascadetrain::logging::init_logger();
    let args = Args::parse();

    let raw = load_config(&args.config)?;
    let config = raw
        .validate()
        .with_context(|| format!("Invalid config: {}", args.config.display()))?;
    info!("Loaded config '{}' from {}", config.experiment_id, args.config.display());

    let index = device_index(&args);
    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(index)?
    } else {
        Device::Cpu
    };
    let ctx = ExecutionContext::single(device);

    let mut run = CascadeRun::new(config, ctx)?;
    core::run(&mut run)?;

    info!("Training completed successfully");
    Ok(())
}
