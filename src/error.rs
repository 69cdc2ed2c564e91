use thiserror::Error;

use crate::compliance::CaptureError;

/// Error types for the proctoring relay and its clients
#[derive(Debug, Error)]
pub enum RelayError {
    /// Signaling errors
    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Relay did not assign a connection identity")]
    MissingIdentity,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Negotiation errors
    #[error("Failed to create peer connection: {0}")]
    PeerConnectionCreation(String),

    #[error("Failed to create offer: {0}")]
    CreateOfferFailed(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("Invalid SDP payload: {0}")]
    InvalidSdp(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescriptionFailed(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidateFailed(String),

    #[error("Failed to attach capture stream: {0}")]
    AttachStreamFailed(String),

    /// Capture errors
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    /// Network errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::Internal(msg.into())
    }
}

impl From<webrtc::Error> for RelayError {
    fn from(err: webrtc::Error) -> Self {
        RelayError::WebRtcApi(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RelayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RelayError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::InvalidSdp("missing sdp".to_string());
        assert_eq!(err.to_string(), "Invalid SDP payload: missing sdp");
    }

    #[test]
    fn test_error_helpers() {
        let err = RelayError::internal("Something went wrong");
        assert!(matches!(err, RelayError::Internal(_)));

        let err = RelayError::Timeout("waiting for answer".to_string());
        assert_eq!(err.to_string(), "Operation timed out: waiting for answer");
    }

    #[test]
    fn test_capture_error_is_transparent() {
        let err: RelayError = CaptureError::NoDevice.into();
        assert_eq!(err.to_string(), CaptureError::NoDevice.to_string());
    }

    #[test]
    fn test_send_error_maps_to_channel_closed() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u8>();
        drop(rx);
        let err: RelayError = tx.send(1).unwrap_err().into();
        assert!(matches!(err, RelayError::ChannelClosed));
    }
}
