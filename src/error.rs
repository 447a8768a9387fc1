//! Error types for the EventBus bridge client

use thiserror::Error;

/// Errors that can occur when using the EventBus bridge client
#[derive(Error, Debug)]
pub enum EventBusError {
    /// Invalid envelope or client configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No usable connection and none could be established
    #[error("Not connected")]
    NotConnected,

    /// The client was closed explicitly and will not reopen
    #[error("Client closed")]
    Closed,

    /// Socket level failure (connect refused, DNS failure, write error)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer closed the stream before a full frame was read
    #[error("Transport closed")]
    TransportClosed,

    /// The peer forcibly reset the connection
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// The bridge sent something the protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No reply arrived on the reply address in time
    #[error("Reply timed out on {reply_address}")]
    ReplyTimeout { reply_address: String },

    /// The `register` frame could not be sent
    #[error("Registration failed for {address}: {reason}")]
    RegistrationFailed { address: String, reason: String },

    /// The `unregister` frame could not be sent
    #[error("Unregistration failed for {address}: {reason}")]
    UnregistrationFailed { address: String, reason: String },

    /// Failed to serialize/deserialize an envelope
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encoded envelope does not fit in a 4-byte length prefix
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

impl EventBusError {
    /// Whether the error means the stream is gone and the connection must be rebuilt
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            EventBusError::TransportClosed
                | EventBusError::ConnectionReset
                | EventBusError::Transport(_)
                | EventBusError::NotConnected
        )
    }
}

impl From<std::io::Error> for EventBusError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionReset => EventBusError::ConnectionReset,
            _ => EventBusError::Transport(e.to_string()),
        }
    }
}

/// Result type for EventBus operations
pub type Result<T> = std::result::Result<T, EventBusError>;
