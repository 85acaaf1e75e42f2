//! Console logging setup for processes embedding the router.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::{Result, RouterError};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,mk_router=debug";

/// Install a compact console subscriber. `RUST_LOG` overrides `filter`.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false).compact())
        .try_init()
        .map_err(|e| RouterError::Config(format!("Failed to initialize logging: {e}")))
}
