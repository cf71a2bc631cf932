//! Error types for the hole-punching library.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Hole-punching errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HolepunchError {
    /// I/O failure at the transport layer.
    #[error("network error: {0}")]
    Network(#[source] ErrorContext),

    /// The signaling service answered with a non-2xx status code.
    #[error("server returned HTTP {0}")]
    HttpNonOk(u16),

    /// JSON was present but a required field was missing or ill-typed.
    #[error("unexpected schema: {0}")]
    Schema(String),

    /// A bounded wait elapsed without a matching event.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A session phase was called out of order.
    #[error("session phase called out of order: {0}")]
    Uninitialized(&'static str),

    /// The caller-supplied buffer is too small.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Random bytes or base64 handling failed.
    #[error("crypto error: {0}")]
    Crypto(#[source] ErrorContext),

    /// Catch-all for detected internal violations.
    #[error("{0}")]
    Unknown(String),
}

impl HolepunchError {
    /// Create a network error with context only.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(ErrorContext::new(message))
    }

    /// Create a network error with preserved source.
    pub fn network_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Network(ErrorContext::with_source(message, source))
    }

    /// Create a crypto error with preserved source.
    pub fn crypto_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Crypto(ErrorContext::with_source(message, source))
    }
}

impl From<std::io::Error> for HolepunchError {
    fn from(e: std::io::Error) -> Self {
        Self::network_with_source("I/O failed", e)
    }
}

impl From<reqwest::Error> for HolepunchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::HttpNonOk(status.as_u16()),
            None => Self::network_with_source("HTTP request failed", e),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HolepunchError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::network_with_source("websocket failure", e)
    }
}

impl From<serde_json::Error> for HolepunchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Schema(e.to_string())
    }
}

impl From<base64::DecodeError> for HolepunchError {
    fn from(e: base64::DecodeError) -> Self {
        Self::crypto_with_source("base64 decode failed", e)
    }
}

/// Result type alias for hole-punching operations.
pub type Result<T> = std::result::Result<T, HolepunchError>;
