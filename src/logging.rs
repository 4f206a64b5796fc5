//! Tracing setup for hosts that do not install their own subscriber.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log compilation and widening decisions at debug level.
    pub verbose: bool,
}

impl LogConfig {
    pub fn default_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// `RUST_LOG` if set, otherwise the level from `verbose`.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_level()))
    }
}

/// Install a global `fmt` subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(config.filter())
        .with(fmt::layer())
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}
