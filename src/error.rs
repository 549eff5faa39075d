//! Error types for the channel registry.

use crate::state::ChannelState;
use thiserror::Error;

/// Main error type for registry operations.
///
/// Transport-level flakiness is deliberately absent here: timeouts, drops,
/// and mid-stream errors are absorbed by the per-channel state machine and
/// retried per policy. Only operations that cannot proceed at all surface
/// an error to the caller.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel {key} is {state:?}, not connected")]
    NotConnected { key: String, state: ChannelState },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
