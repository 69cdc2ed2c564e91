//! Seam between the negotiation logic and the real-time media transport.
//!
//! The relay clients only orchestrate offer/answer/candidate exchange; the media
//! path itself belongs to a [`PeerTransport`] implementation.

mod loopback;
mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::compliance::CaptureStream;
use crate::error::{RelayError, Result};
use crate::relay::ConnectionId;

pub use self::loopback::{LoopbackSession, LoopbackTransport};
pub use self::rtc::{WebRtcSession, WebRtcTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer, in the `{ "type", "sdp" }` shape browsers use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone()).map_err(|e| RelayError::InvalidSdp(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| RelayError::AddIceCandidateFailed(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Disconnected or failed; never retried automatically.
    pub fn is_lost(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }
}

/// Notifications raised by a peer session, tagged with the remote identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    IceCandidate {
        peer: ConnectionId,
        candidate: IceCandidate,
    },
    StateChanged {
        peer: ConnectionId,
        state: PeerState,
    },
}

impl PeerEvent {
    pub fn peer(&self) -> &ConnectionId {
        match self {
            PeerEvent::IceCandidate { peer, .. } | PeerEvent::StateChanged { peer, .. } => peer,
        }
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Opens a negotiation context towards `remote`. Candidates and state changes
    /// are reported on `events`.
    async fn create_session(
        &self,
        remote: ConnectionId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>>;
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    fn remote(&self) -> &ConnectionId;

    /// Creates a receive-only offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Creates an answer to the applied remote offer and installs it locally.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Publishes every track of the capture stream on this session.
    async fn attach_stream(&self, stream: &CaptureStream) -> Result<()>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_description_payload_shape() {
        let offer = SessionDescription::offer("v=0");
        assert_eq!(offer.to_payload(), json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(SessionDescription::from_payload(&offer.to_payload()).unwrap(), offer);
    }

    #[test]
    fn test_invalid_description_payload() {
        let err = SessionDescription::from_payload(&json!({"type": "rollback"})).unwrap_err();
        assert!(matches!(err, RelayError::InvalidSdp(_)));
    }

    #[test]
    fn test_browser_candidate_payload_parses() {
        let candidate = IceCandidate::from_payload(&json!({
            "candidate": "candidate:842163049 1 udp 1677729535 1.2.3.4 46154 typ srflx",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        }))
        .unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_lost_states() {
        assert!(PeerState::Failed.is_lost());
        assert!(PeerState::Disconnected.is_lost());
        assert!(!PeerState::Closed.is_lost());
        assert!(!PeerState::Connected.is_lost());
    }
}
