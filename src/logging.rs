use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use flexi_logger::{colored_default_format, detailed_format, Logger, LoggerHandle, WriteMode};
use log::Level;

#[derive(Args, Debug)]
#[group(id = "logging")]
pub struct Params {
    #[clap(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// Take the log specification from this TOML file instead; it is created if missing
    #[arg(long = "log-spec", value_name = "TOML FILE", env = "MTR_LOG_SPEC")]
    log_spec: Option<PathBuf>,
}

/// Starts the logger on stderr, since stdout carries the trace reports.
pub fn configure_from(params: &Params) -> Result<LoggerHandle> {
    // Even -qq keeps errors visible
    let level = params.verbose.log_level().unwrap_or(Level::Error);

    let logger = Logger::try_with_env_or_str(level.as_str())
        .context("Invalid log specification in RUST_LOG")?
        .write_mode(WriteMode::Async)
        .format_for_stderr(colored_default_format)
        .format_for_files(detailed_format);

    match &params.log_spec {
        Some(path) => logger
            .start_with_specfile(path)
            .with_context(|| format!("Cannot start logging from spec file {}", path.display())),
        None => logger.start().context("Cannot start logging"),
    }
}
