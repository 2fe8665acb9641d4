//! Synchronization error types

use thiserror::Error;

/// Failures of the underlying pub/sub transport.
///
/// None of these are fatal: connection failures feed the reconnect loop and
/// publish failures are logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connect timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection closed")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Outbound buffer full")]
    Backpressure,

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// A payload that could not be decoded into a known message.
#[derive(Debug, Error)]
#[error("Malformed message: {0}")]
pub struct MalformedMessage(#[from] pub serde_json::Error);

pub type Result<T> = std::result::Result<T, TransportError>;
