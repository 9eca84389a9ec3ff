//! Structured JSON logging for `stackc`.
//!
//! Logs go to stderr so the build report on stdout stays machine-readable.
//! Each plan step runs inside a `build_step` span, and the JSON lines carry the
//! current span so a failure can be traced back to the node that raised it.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber at `log_level`. `RUST_LOG` overrides it.
///
/// # Errors
///
/// Returns an error if a subscriber has already been set.
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise stackc log subscriber: {e}"))
}
