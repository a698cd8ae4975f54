//! Tracing subscriber setup.
//!
//! Log lines go to stderr so that `ssync status` output on stdout stays
//! machine-readable. `RUST_LOG` takes precedence over `[logging].level`;
//! `--verbose` forces `debug`.

use anyhow::{bail, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        "pretty" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        other => bail!("Unknown log format: '{}'. Must be pretty or json.", other),
    };
    // A subscriber installed earlier in the process (tests) is fine.
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already set: {e}");
    }
    Ok(())
}
