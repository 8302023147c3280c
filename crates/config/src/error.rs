//! Configuration error type.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Configuration failures are the only fatal error path in the system;
/// they surface at startup and abort before any component is constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    /// The YAML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Environment variable expansion failed.
    #[error("failed to expand environment variables: {0}")]
    Expand(String),

    /// A semantic validation failed.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Short stable kind string for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "config_read",
            Self::Parse(_) => "config_parse",
            Self::Expand(_) => "config_expand",
            Self::Invalid(_) => "config_invalid",
        }
    }
}
