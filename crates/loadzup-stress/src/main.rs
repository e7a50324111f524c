use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use loadzup::config::Config;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Hammers the bundle loader with concurrent loads and unloads.
///
/// After all workloads have finished, every bundle has to be released again.
#[derive(Parser)]
#[command(version, about)]
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

    /// Emits logs and metrics into local sinks, like a production setup would.
    #[arg(long)]
    instrumented: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            loadzup::logging::ensure_log_error(&error);
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

    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // SAFETY: the runtime and its threads do not exist yet.
    let logging_guard = unsafe {
        logging::init(
            logging::Config {
                tracing: cli.instrumented,
                metrics: cli.instrumented,
            },
            &config,
        )?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async move {
        if let Some(udp_sink) = logging_guard.udp_sink {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(config, workloads, cli.duration).await
    })
}
