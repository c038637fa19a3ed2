//! Logging utilities
//!
//! Tracing subscriber initialization for binaries and tests using Tapestry.
//! Library code stays subscriber-agnostic and only emits `tracing` events.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber with sensible defaults
///
/// Structured, compact output filtered through `RUST_LOG` (default "info"),
/// e.g. `RUST_LOG=tapestry_connection=debug,tapestry_transport=trace`.
///
/// # Panics
/// Panics if a subscriber is already installed (call once per process).
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    init_with(env_filter);
}

/// Initialize the tracing subscriber with an explicit filter
///
/// # Panics
/// Panics if a subscriber is already installed or the filter is invalid.
pub fn init_tracing_with_filter(filter: &str) {
    init_with(EnvFilter::new(filter));
}

fn init_with(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .compact(),
        )
        .init();
}
