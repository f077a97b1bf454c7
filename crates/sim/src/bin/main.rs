//! qnet simulator CLI.
//!
//! Runs the queuing-network simulation for a fixed wall-clock duration and
//! writes the results document to a JSON file.
//!
//! # Example
//!
//! ```bash
//! qnet-sim --duration 60 --rate 2.0 --seed 325
//! RUST_LOG=qnet_sim=debug qnet-sim -d 10
//! ```

use clap::Parser;
use qnet_sim::{SimConfig, SimulationEngine};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "qnet-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Simulation duration in seconds
    #[arg(short = 'd', long, default_value = "60")]
    duration: f64,

    /// Request generation rate per client (requests/second)
    #[arg(short = 'r', long, default_value = "2.0")]
    rate: f64,

    /// Random seed for reproducible runs
    #[arg(long, default_value = "325")]
    seed: u64,

    /// Path of the JSON results document
    #[arg(long, default_value = "simulation_results.json")]
    results: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,qnet_sim=info")),
        )
        .init();

    let args = Args::parse();

    if !args.duration.is_finite() || args.duration <= 0.0 {
        eprintln!("configuration error: duration must be positive");
        std::process::exit(1);
    }
    let config = SimConfig::default()
        .with_duration(Duration::from_secs_f64(args.duration))
        .with_rate(args.rate)
        .with_seed(args.seed);

    let engine = match SimulationEngine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");
    let report = runtime.block_on(engine.run());

    report.print_summary();

    let json = serde_json::to_string_pretty(&report).expect("report serializes");
    if let Err(err) = std::fs::write(&args.results, json) {
        eprintln!("failed to write {}: {err}", args.results.display());
        std::process::exit(1);
    }
    info!(path = %args.results.display(), "results written");
}
