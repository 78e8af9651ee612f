//! Run a trajectory on the simulated bench and print the run summary as JSON.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rampctl_bench::{logging, Bench, BenchConfig};
use rampctl_core::executor::RunState;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "rampctl-bench",
    version,
    about = "Run a ramp trajectory against simulated hardware with the temperature interlock"
)]
struct Cli {
    /// Bench configuration file (TOML)
    config: PathBuf,

    /// Override the configured time scale
    #[arg(short, long)]
    time_scale: Option<f64>,

    /// Load and validate the configuration and trajectory, then exit
    #[arg(long)]
    validate_only: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let mut config = BenchConfig::from_path(&cli.config)
        .with_context(|| format!("load {}", cli.config.display()))?;
    if let Some(scale) = cli.time_scale {
        config.time_scale = scale;
    }

    let trajectory = config.load_trajectory().context("load trajectory")?;
    let report = trajectory.validate();
    if !report.is_valid() {
        bail!("invalid trajectory {}: {}", trajectory.name, report);
    }
    info!(
        "Trajectory {}: {} segments, {:.1} s",
        trajectory.name,
        trajectory.segment_count(),
        trajectory.total_duration()
    );

    if cli.validate_only {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut bench = Bench::new(config, trajectory).context("set up bench")?;
    let summary = bench.run().context("run trajectory")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.final_state != RunState::Completed {
        bail!(
            "run ended {}{}",
            summary.final_state,
            summary
                .error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
