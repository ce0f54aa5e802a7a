//! Configuration error types.

use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A URL option is not an absolute http(s) URL.
    #[error("invalid URL for {field} '{url}': {message}")]
    InvalidUrl {
        field: &'static str,
        url: String,
        message: String,
    },

    /// A duration option has a value that cannot be used.
    #[error("invalid duration for {field} '{value}': {message}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        message: String,
    },

    /// Any other option with an unusable value.
    #[error("invalid value for {field} '{value}': {message}")]
    InvalidValue {
        field: &'static str,
        value: String,
        message: String,
    },
}

impl ConfigError {
    /// Environment variable or option the error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigError::InvalidUrl { field, .. }
            | ConfigError::InvalidDuration { field, .. }
            | ConfigError::InvalidValue { field, .. } => field,
        }
    }
}
