//! Error types for the CoAP observe server
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

use crate::message::Method;

/// Result type alias for CoAP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the CoAP observe server
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed datagram or unencodable message
    #[error("Codec error: {0}")]
    Codec(String),

    /// Transport-level failures (socket closed, unreachable destination)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller violated an operation precondition
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The resource does not implement the requested method
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(Method),

    /// The request was understood but its content is unusable
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a method-not-allowed error
    pub fn method_not_allowed(method: Method) -> Self {
        Self::MethodNotAllowed(method)
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
