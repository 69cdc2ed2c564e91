use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::{ConnectionId, Roster};

/// Negotiation payload addressed to another connection. The payload is opaque
/// to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub target: ConnectionId,
    #[serde(default)]
    pub payload: Value,
}

/// Negotiation payload as delivered to its target, stamped with the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedSignal {
    pub source: ConnectionId,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    pub fn into_server_message(self, signal: ForwardedSignal) -> ServerMessage {
        match self {
            SignalKind::Offer => ServerMessage::Offer(signal),
            SignalKind::Answer => ServerMessage::Answer(signal),
            SignalKind::IceCandidate => ServerMessage::IceCandidate(signal),
        }
    }

    pub fn into_client_message(self, envelope: SignalEnvelope) -> ClientMessage {
        match self {
            SignalKind::Offer => ClientMessage::Offer(envelope),
            SignalKind::Answer => ClientMessage::Answer(envelope),
            SignalKind::IceCandidate => ClientMessage::IceCandidate(envelope),
        }
    }
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    AdminAuth(String),
    JoinExam(String),
    GetUserList,
    Offer(SignalEnvelope),
    Answer(SignalEnvelope),
    IceCandidate(SignalEnvelope),
    EndExam,
}

impl ClientMessage {
    /// Splits a negotiation message into its kind and envelope.
    pub fn as_signal(&self) -> Option<(SignalKind, &SignalEnvelope)> {
        match self {
            ClientMessage::Offer(e) => Some((SignalKind::Offer, e)),
            ClientMessage::Answer(e) => Some((SignalKind::Answer, e)),
            ClientMessage::IceCandidate(e) => Some((SignalKind::IceCandidate, e)),
            _ => None,
        }
    }
}

/// Events the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Connected { id: ConnectionId },
    AuthSuccess,
    AuthFailed(String),
    UserList(Roster),
    Offer(ForwardedSignal),
    Answer(ForwardedSignal),
    IceCandidate(ForwardedSignal),
    Error(String),
}

impl ServerMessage {
    pub fn as_signal(&self) -> Option<(SignalKind, &ForwardedSignal)> {
        match self {
            ServerMessage::Offer(s) => Some((SignalKind::Offer, s)),
            ServerMessage::Answer(s) => Some((SignalKind::Answer, s)),
            ServerMessage::IceCandidate(s) => Some((SignalKind::IceCandidate, s)),
            _ => None,
        }
    }
}
