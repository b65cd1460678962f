//! Error types for the bridge engine
//!
//! Domain errors use thiserror and convert into [`BridgeError`] at the engine
//! boundary. Apart from [`BridgeError::MissingHost`], none of these are fatal:
//! the engine logs them and keeps running.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level bridge error
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The engine was built without a host object to bind against
    #[error("bridge engine requires a host object")]
    MissingHost,

    /// A local name could not be resolved on the host object
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// The gateway returned something that is not a valid envelope
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The HTTP exchange with the gateway failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The gateway URL could not be parsed
    #[error("Invalid server url '{url}': {detail}")]
    InvalidUrl {
        /// URL as configured
        url: String,
        /// Parser message
        detail: String,
    },

    /// Configuration file errors
    #[error("Configuration error in {path}: {detail}")]
    Config {
        /// File that failed to load
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// A synchronous GET did not complete in time
    #[error("GET '{key}' timed out after {elapsed:?}")]
    Timeout {
        /// Requested key
        key: String,
        /// Configured wait bound
        elapsed: Duration,
    },

    /// The dispatch channel closed while a request was outstanding
    #[error("dispatch channel closed")]
    DispatchClosed,
}

/// Resolution failures from the capability registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// No handler (or emittable event) with this name
    #[error("handler '{0}' not found")]
    HandlerNotFound(String),

    /// No emittable event with this name
    #[error("event '{0}' not found")]
    EventNotFound(String),

    /// No field with this name
    #[error("field '{0}' not found")]
    FieldNotFound(String),

    /// Field exists but cannot be written
    #[error("field '{0}' is read-only")]
    NotWritable(String),

    /// Field exists but has no change notification
    #[error("field '{0}' has no change notification")]
    NotObservable(String),
}

/// Envelope decoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Body was not JSON at all
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON was valid but not an object
    #[error("expected a json object, got {0}")]
    NotAnObject(String),

    /// Object did not carry the expected command key
    #[error("missing top-level key '{0}'")]
    MissingKey(String),

    /// Streamed frame did not have the `[type, name, ...]` shape
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Convenience result alias for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// HTTP exchange failures
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection could not be established or was reset
    #[error("connection failed: {0}")]
    Connection(String),

    /// Gateway answered with a non-success status
    #[error("gateway returned status {0}")]
    Status(u16),

    /// Request exceeded the configured timeout
    #[error("request timed out")]
    Timeout,

    /// Stream ended (gateway closed the body)
    #[error("stream closed by gateway")]
    Closed,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Connection(err.to_string())
    }
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type using BridgeError
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
