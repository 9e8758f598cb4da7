//! Logging initialization.
//!
//! Every component logs through `tracing`; nothing is printed until a
//! subscriber is installed. The level is controlled by `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=debug ember            # per-request detail, evictions
//! RUST_LOG=ember_core=trace ember # everything from the engine
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a formatted stdout subscriber filtered by `RUST_LOG`, defaulting
/// to `info`. Calling it again is a no-op.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Like [`init_logging`], with `level` as the fallback when `RUST_LOG` is unset.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
