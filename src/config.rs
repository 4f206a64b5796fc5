//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! [cache]
//! memory_budget_bytes = 268435456
//! mask_cache_entries = 2048
//!
//! [json_schema]
//! any_whitespace = false
//! indent = 2
//! property_order = "declared"
//! unsupported_keywords = "reject"
//!
//! [session]
//! max_rollback = 8
//! start_in_reasoning = true
//!
//! [logging]
//! verbose = true
//! ```
//!
//! Every field is optional.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::json_schema::JsonSchemaOptions;
use crate::logging::LogConfig;
use crate::matcher::SessionConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub json_schema: JsonSchemaOptions,
    pub session: SessionConfig,
    pub logging: LogConfig,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid engine config: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse engine config TOML")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize engine config")
    }
}
