//! Error types for the realtime voice client.
//!
//! Transport-level failures (parse errors, individual send failures) are
//! isolated and reported without tearing down the connection. Connection-level
//! failures (timeouts, heartbeat death, unclean close) tear the connection down
//! and hand off to the reconnection manager when it is enabled.

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Client Errors
// =============================================================================

/// Errors that can occur while driving a realtime conversation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// A command was attempted without an open socket
    #[error("Not connected")]
    NotConnected,

    /// The negotiated transport cannot carry binary frames
    #[error("Transport does not support binary frames")]
    BinaryUnsupported,

    /// Malformed inbound text frame
    #[error("Message parse error: {0}")]
    MessageParseError(String),

    /// Connect attempt exceeded its budget
    #[error("Connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// No traffic observed between two heartbeat ticks
    #[error("Ping timeout: no traffic since the previous heartbeat")]
    PingTimeout,

    /// The peer did not answer an application-level ping
    #[error("Pong timeout")]
    PongTimeout,

    /// The ingress bridge was used before an engine was bound
    #[error("No client bound")]
    NoClientBound,

    /// The connection URL cannot be built without an auth token
    #[error("Auth token is required to connect")]
    MissingAuthToken,

    /// `connect()` was called while a connect attempt is in flight
    #[error("Connection attempt already in progress")]
    AlreadyConnecting,

    /// Connection to the backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Outbound command could not be serialized
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An individual outbound frame could not be queued
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// All reconnection attempts were exhausted
    #[error("Reconnection failed: {0}")]
    ReconnectionFailed(String),
}

impl ClientError {
    /// Whether the caller can reasonably retry or keep going after this error.
    ///
    /// Programmer errors and capability mismatches are not recoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ClientError::BinaryUnsupported
                | ClientError::NoClientBound
                | ClientError::MissingAuthToken
                | ClientError::InvalidConfiguration(_)
        )
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

// =============================================================================
// Audio Errors
// =============================================================================

/// Errors raised by audio collaborators (capture sources and playback sinks).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AudioError {
    /// The playback or capture device rejected the operation
    #[error("Audio device error: {0}")]
    Device(String),

    /// Audio is not 16-bit mono linear PCM or has an unusable layout
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    /// File I/O failed
    #[error("Audio I/O error: {0}")]
    Io(String),
}

impl From<hound::Error> for AudioError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => AudioError::Io(e.to_string()),
            other => AudioError::InvalidFormat(other.to_string()),
        }
    }
}

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ClientError::NotConnected.to_string(), "Not connected");
        assert!(
            ClientError::ConnectionTimeout(Duration::from_millis(250))
                .to_string()
                .contains("250ms")
        );
        assert!(
            ClientError::MessageParseError("missing type".to_string())
                .to_string()
                .contains("missing type")
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(ClientError::NotConnected.is_recoverable());
        assert!(ClientError::MessageParseError(String::new()).is_recoverable());
        assert!(ClientError::PingTimeout.is_recoverable());
        assert!(ClientError::ConnectionTimeout(Duration::from_secs(1)).is_recoverable());
        assert!(!ClientError::BinaryUnsupported.is_recoverable());
        assert!(!ClientError::NoClientBound.is_recoverable());
        assert!(!ClientError::MissingAuthToken.is_recoverable());
    }

    #[test]
    fn test_audio_error_from_hound() {
        let err: AudioError = hound::Error::Unsupported.into();
        assert!(matches!(err, AudioError::InvalidFormat(_)));
    }
}
