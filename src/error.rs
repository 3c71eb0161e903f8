//! Error types for pm2io-transport

use thiserror::Error;

/// Errors that can occur in the transport layer
///
/// Most of these never reach the host: the fire-and-forget surface
/// (`send`, `connect`, `close_and_reconnect`) logs them and self-heals.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Generic connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Directory service did not yield an endpoint
    #[error("Failed to resolve endpoint: {0}")]
    Resolve(String),

    /// Socket could not be opened
    #[error("Failed to dial endpoint '{endpoint}': {reason}")]
    Dial { endpoint: String, reason: String },

    /// Write to the socket or channel failed
    #[error("Send failed: {0}")]
    Send(String),

    /// No session is currently established
    #[error("Not connected")]
    NotConnected,

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization failure
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Inbound frame that could not be interpreted
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An action with the same name is already registered
    #[error("Action already registered: {0}")]
    DuplicateAction(String),

    /// No action registered under the requested name
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
