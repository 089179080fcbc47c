use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cartsync_service::config::Config as CartsyncConfig;
use clap::Parser;
use humantime::parse_duration;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

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
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable reporting to a local sentry sink.
    #[arg(long)]
    sentry: bool,

    /// Enable JSON logging into a no-op writer.
    #[arg(long)]
    tracing: bool,

    /// Enable reporting metrics to a local statsd sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            cartsync_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config_path = cli.config;
    let service_config = CartsyncConfig::get(config_path.as_deref())?;

    let logging_config = logging::Config {
        backtraces: true,
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: No other threads are running yet, the runtime is built afterwards.
    let guard = unsafe { logging::init(logging_config, &service_config)? };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(async move {
        if let Some(http_sink) = guard.http_sink {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = guard.udp_sink {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(service_config, workloads, cli.duration).await
    })
}
