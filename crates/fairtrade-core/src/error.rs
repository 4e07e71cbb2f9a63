//! Error types for fair-trade sessions

use thiserror::Error;

/// Result type alias for fair-trade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or executing a trade
#[derive(Debug, Error)]
pub enum Error {
    /// Bad construction arguments or unreadable storage
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operation invoked out of sequence
    #[error("{operation} is not valid in state {state}")]
    State {
        operation: &'static str,
        state: String,
    },

    /// Malformed or mismatched peer message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Structurally inconsistent response or receipt
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Released secret does not reproduce the bulletin-committed plaintext
    #[error("Secret does not reproduce committed plaintext: {0}")]
    Secret(String),

    /// Dataset access out of bounds
    #[error("Data error: {0}")]
    Data(String),

    /// Session key material erased or unavailable
    #[error("Resource unavailable: {0}")]
    Resource(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Storage error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Error::State {
            operation,
            state: format!("{:?}", state),
        }
    }

    /// Errors after which the session must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Resource(_) | Error::Io(_))
    }

    /// Only a failed secret verification leaves the buyer able to file a claim
    pub fn is_claimable(&self) -> bool {
        matches!(self, Error::Secret(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::Config("x".into()).is_fatal());
        assert!(!Error::Protocol("x".into()).is_fatal());
        assert!(Error::Secret("x".into()).is_claimable());
        assert!(!Error::Validation("x".into()).is_claimable());
    }

    #[test]
    fn test_state_message() {
        #[derive(Debug)]
        enum Phase {
            ReceiptSent,
        }

        let err = Error::state("decrypt", Phase::ReceiptSent);
        assert_eq!(err.to_string(), "decrypt is not valid in state ReceiptSent");
    }
}
