//! Tracing subscriber setup for binaries and test harnesses.
//!
//! Library code only emits through `tracing`; installing a subscriber is
//! left to the embedding process.

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a human-readable subscriber.
///
/// `RUST_LOG` takes priority; `default_filter` (e.g. `"pipelab=info"`)
/// applies when it is unset or invalid.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter(default_filter))
        .try_init()
        .context("installing tracing subscriber")
}

/// Installs a subscriber writing one JSON object per event.
pub fn init_json_tracing(default_filter: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json().with_current_span(true))
        .with(env_filter(default_filter))
        .try_init()
        .context("installing JSON tracing subscriber")
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}
