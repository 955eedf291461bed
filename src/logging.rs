//! Tracing subscriber setup for the CLI.
//!
//! Filter directives come from `CONDENSE_LOG`, then `RUST_LOG`, then the
//! default (`info`, or `debug` with `--verbose`). HTTP client crates are always
//! capped at `warn`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const NOISY_CRATES: &str = ",hyper=warn,hyper_util=warn,reqwest=warn,h2=warn,rustls=warn";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    /// JSON lines on stderr instead of human-readable output.
    pub json: bool,
    /// Also write daily-rotated JSON logs here.
    pub directory: Option<PathBuf>,
}

/// Build the filter directive string.
pub fn filter_directives(
    verbose: bool,
    condense_log: Option<&str>,
    rust_log: Option<&str>,
) -> String {
    let base = condense_log
        .or(rust_log)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());
    format!("{}{}", base, NOISY_CRATES)
}

/// Install the global subscriber. Safe to call once per process.
pub fn init(options: &LogOptions) -> Result<()> {
    let directives = filter_directives(
        options.verbose,
        std::env::var("CONDENSE_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter: {}", directives))?;

    let mut layers = Vec::new();
    if options.json {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .json()
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(options.verbose)
                .compact()
                .boxed(),
        );
    }

    if let Some(dir) = &options.directory {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, "condense.log");
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(appender)
                .json()
                .with_ansi(false)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}
