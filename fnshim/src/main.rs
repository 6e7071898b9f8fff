//! fnshim - local function host
//!
//! Loads one handler, then reads invocation requests from stdin, one JSON
//! document per line, and writes framed results to stdout and stderr.

mod config;
mod handlers;

use clap::Parser;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Settings;
use fnshim_runtime::StartupConfig;

#[derive(Parser, Debug)]
#[command(name = "fnshim")]
#[command(about = "Run a function handler over a line-oriented stdio protocol", long_about = None)]
struct Args {
    /// [handler_dir] <module> <function> <function_name> <timeout_secs>
    #[arg(value_name = "PARAMS", allow_hyphen_values = true)]
    params: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Source-root prefix for the watch set
    #[arg(long)]
    watch_prefix: Option<String>,

    /// Settings file; defaults to ./fnshim.toml when present
    #[arg(long, env = "FNSHIM_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    // stdout carries the protocol, so diagnostics go to stderr
    let log_level = args.log_level.as_deref().unwrap_or(&settings.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fnshim={log_level},fnshim_runtime={log_level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();

    let startup = StartupConfig::from_args(args.params.as_slice())?;
    let mut options = settings.shim_options();
    if let Some(prefix) = args.watch_prefix {
        options.watch_prefix = Some(prefix);
    }

    let mut registry = handlers::registry();
    let stats = fnshim_runtime::run_stdio(startup, options, &mut registry)?;
    debug!(
        invocations = stats.invocations,
        successes = stats.successes,
        failures = stats.failures,
        "Shutting down"
    );

    Ok(())
}
