//! Observability - Structured Logging Setup
//!
//! One call at process start wires `tracing` to stderr with env-filter
//! support (`RUST_LOG=forgeimages_core=debug,tower_http=info` etc.), matching
//! the logging stack the pack's daemon/service examples already use.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber. Safe to call once; a second call is a
/// logic error in the caller and is reported, not silently ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
