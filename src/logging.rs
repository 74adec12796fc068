//! Logging initialization.
//!
//! The teacher crate declares both `log` and `tracing` as dependencies but
//! never wires either up. This fills that gap with a `tracing-subscriber`
//! env-filter + fmt pipeline, driven by `RUST_LOG` when set and falling back
//! to the server's configured `log_level` otherwise.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Safe to call once at process startup. `default_level` is used when
/// `RUST_LOG` is not set in the environment (e.g. the `log_level` read from
/// the server configuration).
pub fn init_logging(default_level: &str) -> crate::error::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| crate::error::BloomdError::Internal(format!("logging init failed: {e}")))
}
