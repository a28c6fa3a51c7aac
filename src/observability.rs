//! Tracing initialization for repman.

use crate::config::ObservabilityConfig;
use crate::error::{RepmanError, Result};
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber from configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| RepmanError::Config(format!("Invalid log level filter: {}", e)))?;

    if config.json_logs {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    }

    Ok(())
}
