use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use syncgroup::config::Config;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable tracing output, written into the void.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to a local sink.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads = WorkloadsConfig::get(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref())?;

    let options = logging::Options {
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: The runtime and its threads are only started below.
    let guard = unsafe { logging::init(&config, options)? };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async move {
        if let Some(udp_sink) = guard.udp_sink {
            tokio::spawn(udp_sink);
        }
        perform_stresstest(workloads, cli.duration).await
    })
}
