//! Shared utilities for MONXRT: error types, logging, clock, debug options.
//!
//! This crate provides common infrastructure used across all MONXRT
//! components.

#![forbid(unsafe_code)]

pub mod debug;
pub mod error;
pub mod time;

pub use error::{Error, Result};

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable, falling
/// back to the `MONXRT_LOG` debug option. Defaults to `info` if neither is
/// set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let fallback = debug::get_str("MONXRT_LOG").unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
