//! Structured logging for the Tellus surface renderer.
//!
//! Thin wrapper around the `tracing` ecosystem: console output with uptime
//! timestamps and module paths, filterable per subsystem, overridable via
//! `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `filter_override` takes precedence over the built-in default; the
/// `RUST_LOG` environment variable takes precedence over both.
pub fn init_logging(filter_override: Option<&str>) {
    let filter_str = filter_override.unwrap_or("info");

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true) // the tile loader thread is named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info")
}
