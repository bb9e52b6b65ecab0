//! Tracing initialization for the provider
//!
//! Every format writes to stderr. Stdout carries remote command output and the
//! `status` answer, so nothing else may be written there.

use nomad_core::error::{Result, WorkspaceError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber with environment-based configuration
///
/// Uses standard RUST_LOG environment variable for filtering:
/// - `RUST_LOG=debug` - Set global level
/// - `RUST_LOG=devpod_nomad=info,nomad_provider=debug` - Set per-module levels
/// - `RUST_LOG=devpod_nomad[request_id=abc123]` - Filter by span fields
///
/// Uses RUST_LOG_FORMAT for output format (optional):
/// - `json` - JSON formatted output
/// - `pretty` - Pretty formatted output
/// - `compact` - Compact single-line output (default)
pub fn init() -> Result<()> {
    init_with_defaults("info")
}

/// Initialize with a default filter if RUST_LOG is not set
pub fn init_with_defaults(default_filter: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format.as_str() {
        "json" => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false).json())
            .try_init(),
        "pretty" => registry
            .with(fmt::layer().with_writer(std::io::stderr).pretty())
            .try_init(),
        _ => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
    };

    result.map_err(|e| WorkspaceError::Other(anyhow::anyhow!("Failed to initialize tracing: {}", e)))
}

/// Initialize for testing with a specific configuration
#[cfg(test)]
pub fn init_for_testing() -> Result<()> {
    let env_filter = EnvFilter::new("debug");

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .try_init()
        .map_err(|e| {
            WorkspaceError::Other(anyhow::anyhow!("Failed to initialize test tracing: {}", e))
        })
}
