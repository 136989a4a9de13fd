use crate::config::Config;
use crate::util::env_flag;
use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const LOG_ANSI_ENV: &str = "SCENESYNC_LOG_ANSI";

/// Installs the global tracing subscriber. Logs go to `config.log_path` when
/// set, otherwise to stderr; stdout is left to the session transport.
pub fn init(config: &Config) -> Result<()> {
    let filter = build_filter(&config.log_filter)?;

    let installed = match &config.log_path {
        Some(path) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(open_log_file(path)?))
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(resolve_ansi())
            .with_writer(std::io::stderr)
            .try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

fn build_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .with_context(|| format!("Invalid SCENESYNC_LOG filter '{directive}'"))
}

fn resolve_ansi() -> bool {
    env_flag(LOG_ANSI_ENV).unwrap_or_else(|| std::io::stderr().is_terminal())
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file '{}'", path.display()))
}
