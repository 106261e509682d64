//! Tracing subscriber setup for the `webserv` binary.
//!
//! The engine only emits `tracing` events; installing a subscriber is left to
//! the program embedding it. These helpers cover the usual choices.
//!
//! ## Configuration
//!
//! `RUST_LOG` always wins over the level passed in code:
//!
//! ```bash
//! # Per-request and per-connection traces
//! RUST_LOG=debug webserv site.toml
//!
//! # Only the reactor internals at trace level
//! RUST_LOG=info,webserv_core::server=trace webserv site.toml
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Human-readable logs at `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Human-readable logs at `level` (`"trace"`, `"debug"`, `"info"`, `"warn"`, `"error"`).
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().with_target(true))
        .init();
}

/// One JSON object per event, for log shippers.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().json().with_current_span(false))
        .init();
}

/// Like [`init_logging_with_level`] but tolerates an existing subscriber.
/// Integration tests call this from every test function.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(filter("warn"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
