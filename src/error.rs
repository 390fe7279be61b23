//! Error types
//!
//! Cancellation is never reported through [`Error`]: canceled operations
//! return `None`/`false` and expose an `is_canceled()` query instead.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for registry, transport and pattern operations
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON body could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A wire frame did not have the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// An outgoing message would be rejected by its receiver
    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    /// A registry or data-plane round trip exceeded its timeout
    #[error("Timeout")]
    Timeout,

    /// The remote end closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Responder, requester, publisher or subscriber creation failed
    #[error("Creation error: {0}")]
    Creation(String),

    /// The registry answered with a negative value
    #[error("Request rejected ({value}): {message}")]
    Rejected {
        /// Response value sent by the registry
        value: i64,
        /// Human readable reason
        message: String,
    },

    /// Key is not present in the key-value store
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Key is already present in the key-value store
    #[error("Key already exists: {0}")]
    KeyAlreadyExists(String),

    /// The registry does not know the application
    #[error("Undefined application: {0}")]
    UndefinedApplication(String),

    /// Endpoint string could not be parsed
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl Error {
    /// Create a creation error from any message
    pub fn creation(message: impl Into<String>) -> Self {
        Error::Creation(message.into())
    }

    /// Create a decode error from any message
    pub fn decode(message: impl Into<String>) -> Self {
        Error::Decode(message.into())
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
