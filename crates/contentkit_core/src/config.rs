//! Facade configuration.
//!
//! # Invariants
//! - Missing fields fall back to `CoreConfig::default()`.
//! - Unknown fields are rejected so typos do not silently disable locking.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Default bound on commit drain rounds.
pub const DEFAULT_MAX_COMMIT_ROUNDS: usize = 64;

/// Concurrency control applied by the facade on save/delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingMode {
    #[default]
    None,
    Pessimistic,
    Optimistic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub locking: LockingMode,
    pub max_commit_rounds: usize,
    /// Application context passed to the authorizer.
    pub auth_context: String,
    pub log_level: Option<String>,
    pub log_dir: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            locking: LockingMode::None,
            max_commit_rounds: DEFAULT_MAX_COMMIT_ROUNDS,
            auth_context: "default".to_string(),
            log_level: None,
            log_dir: None,
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Initializes file logging when both level and directory are set.
    pub fn init_logging(&self) -> Result<bool, String> {
        match (&self.log_level, &self.log_dir) {
            (Some(level), Some(dir)) => crate::logging::init_logging(level, dir).map(|()| true),
            _ => Ok(false),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "config read error: {err}"),
            Self::Parse(err) => write!(f, "config parse error: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreConfig, LockingMode, DEFAULT_MAX_COMMIT_ROUNDS};

    #[test]
    fn missing_fields_use_defaults() {
        let config = CoreConfig::from_json_str(r#"{"locking": "optimistic"}"#).expect("config");
        assert_eq!(config.locking, LockingMode::Optimistic);
        assert_eq!(config.max_commit_rounds, DEFAULT_MAX_COMMIT_ROUNDS);
        assert_eq!(config.init_logging(), Ok(false));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(CoreConfig::from_json_str(r#"{"lockign": "none"}"#).is_err());
    }
}
