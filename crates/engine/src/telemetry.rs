//! Tracing setup for binaries and tests driving the engine

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global fmt subscriber filtered by `RUST_LOG`
///
/// Falls back to `default_filter` when `RUST_LOG` is unset or invalid.
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
