// Error types for configuration loading

use thiserror::Error;

/// Failure while loading or checking configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A file or `.env` could not be read.
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// A value is present but does not parse as the expected type.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
