//! Push delivery error types.

use thiserror::Error;

/// Result type for push operations.
pub type Result<T> = std::result::Result<T, PushError>;

/// Push delivery and feedback errors.
#[derive(Debug, Error)]
pub enum PushError {
    /// No certificate material was supplied for the scope.
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    /// TCP connect or socket failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate or private key could not be parsed.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Encoded payload exceeds the gateway limit.
    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Device token is not 32 bytes of hex.
    #[error("Invalid device token: {0}")]
    InvalidToken(String),

    /// Feedback stream ended in the middle of a record.
    #[error("Feedback stream truncated: got {got} of {expected} bytes")]
    TruncatedFeedback {
        /// Bytes received for the partial record.
        got: usize,
        /// Record size.
        expected: usize,
    },

    /// Data store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Socket operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PushError {
    /// Check if this error came from the transport (socket, TLS, timeout).
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Tls(_)
                | Self::Timeout(_)
                | Self::Io(_)
                | Self::TruncatedFeedback { .. }
        )
    }

    /// Check if this error is confined to encoding a single notification.
    pub fn is_framing_error(&self) -> bool {
        matches!(self, Self::PayloadTooLarge { .. } | Self::InvalidToken(_))
    }

    /// Check if this error always aborts the current batch regardless of policy.
    pub fn aborts_batch(&self) -> bool {
        !self.is_framing_error()
    }
}

impl From<serde_json::Error> for PushError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<apnkit_config::ConfigError> for PushError {
    fn from(err: apnkit_config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<rustls::Error> for PushError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}
