// src/logging.rs
//! Logging setup
//!
//! The engine only emits `tracing` events. Hosts that have no subscriber of
//! their own can call [`init`].

/// Install a formatting subscriber filtered by `RUST_LOG` (default `info`)
///
/// Fails if a global subscriber is already installed.
pub fn init() -> std::result::Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| e.to_string())
}

/// Install a test-friendly subscriber, ignoring an existing one
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
