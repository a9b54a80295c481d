//! Error surface shared by all broker participants.

use std::time::Duration;

use crate::codec::{CodecError, ErrorPayload};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Already listening")]
    AlreadyListening,

    #[error("Insufficient recipients: required {required}, reached {actual}")]
    InsufficientRecipients { required: u64, actual: u64 },

    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    /// Error raised by the remote worker handler, rehydrated from the wire.
    #[error("Remote handler failure: {0}")]
    Remote(ErrorPayload),
}
