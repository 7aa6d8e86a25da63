//! Log output for the binary.
//!
//! The library crates log through the `log` facade; the subscriber's
//! `tracing-log` bridge picks those records up alongside `tracing` events.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Build the filter: an explicit `level` wins over `RUST_LOG`, which wins
/// over [`DEFAULT_FILTER`].
pub fn filter(level: Option<&str>) -> Result<EnvFilter> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?,
    };
    Ok(filter)
}

/// Install the global subscriber.  Log lines go to stderr so that command
/// output on stdout stays machine-readable.
pub fn init(level: Option<&str>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level)?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}
