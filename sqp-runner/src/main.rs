//! Runner binary for search query performance sync pipelines.
//!
//! Loads the configuration, initializes tracing and metrics, then runs the configured pipeline
//! on its cron schedule until SIGINT or SIGTERM, or a single time with `--once`.

use std::net::SocketAddr;

use clap::Parser;
use sqp_config::shared::RunnerConfig;
use sqp_telemetry::metrics::init_metrics;
use sqp_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_runner_config;
use crate::core::{RunOptions, start_runner_with_config};
use crate::error::{RunnerError, RunnerResult};

mod config;
mod core;
mod error;
mod notification;
mod schedule;
mod steps;

#[derive(Debug, Parser)]
#[command(name = "sqp-runner", version, about = "Runs a search query performance sync pipeline")]
struct Args {
    /// Execute a single run and exit instead of following the schedule.
    #[arg(long)]
    once: bool,

    /// Skip steps completed by the previous failed run.
    #[arg(long)]
    resume: bool,
}

fn main() -> RunnerResult<()> {
    let args = Args::parse();

    // Cargo feature unification can enable more than one rustls provider.
    install_crypto_provider();

    let config = load_runner_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(RunnerError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config, args))
}

async fn async_main(config: RunnerConfig, args: Args) -> RunnerResult<()> {
    let metrics_address = config
        .metrics_address
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()
        .map_err(RunnerError::config)?;
    init_metrics(metrics_address, Some(&config.pipeline.id)).map_err(RunnerError::config)?;

    let options = RunOptions {
        once: args.once,
        resume_from_failure: args.resume,
    };

    if let Err(err) = start_runner_with_config(config, options).await {
        error!(category = err.category(), error_kind = ?err.kind(), "{err}");
        return Err(err);
    }

    Ok(())
}

fn install_crypto_provider() {
    // Fails only when a provider is already installed, which is fine.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
