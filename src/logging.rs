//! Tracing subscriber bootstrap.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! host's choice. `RUST_LOG` overrides the filter passed in.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when neither the caller nor `RUST_LOG` sets one.
pub const DEFAULT_FILTER: &str = "info,notebook_sync=debug,notebook_sync_core=debug";

/// Installs a stderr fmt subscriber.
///
/// Fails instead of panicking when a global subscriber is already set.
pub fn init_logging(filter: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_FILTER)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
