// backuptool/src/logging.rs
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber: leveled, timestamped lines on stderr and,
/// when a log file is configured, the same lines appended there without ANSI
/// colors. `RUST_LOG` overrides the verbosity flag.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_filter = if verbose { "backuptool=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry().with(filter).with(console);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory {}", parent.display())
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file));
            registry
                .with(file_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
        None => {
            registry
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
    }
    Ok(())
}
