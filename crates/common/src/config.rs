//! Common configuration types for the exchange crates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Errors raised while reading configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl ObservabilityConfig {
    /// Load from `LOG_LEVEL` and `LOG_JSON`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `LOG_JSON` is not a boolean.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let log_level = vars.get("LOG_LEVEL").cloned().unwrap_or(defaults.log_level);
        let json_logs = match vars.get("LOG_JSON") {
            Some(value) => parse_bool("LOG_JSON", value)?,
            None => defaults.json_logs,
        };

        Ok(Self {
            log_level,
            json_logs,
        })
    }
}

/// Parse a boolean flag (`true`/`false`/`1`/`0`, case-insensitive).
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] naming `name` for anything else.
pub fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}
