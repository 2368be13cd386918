//! Tracing setup for the command-line tool.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::utils::errors::{BackupError, Result};

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// level; thread names appear in the output so lines from the named
/// backup workers can be told apart.
pub fn init(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| BackupError::Config(format!("invalid log level '{level}': {e}")))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    Ok(())
}
