//! Supervisor-side connection manager: one negotiation context per observed
//! participant, all multiplexed over the supervisor's single signaling channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::relay::{ClientMessage, ConnectionId, ForwardedSignal, Roster, ServerMessage, SignalEnvelope};
use crate::transport::{IceCandidate, PeerEvent, PeerSession, PeerState, PeerTransport, SessionDescription};

/// Per-participant view state shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorStatus {
    Connecting,
    Live,
    Disconnected,
    Failed,
}

impl SupervisorStatus {
    fn from_peer_state(state: PeerState) -> Option<Self> {
        match state {
            PeerState::New | PeerState::Connecting => Some(SupervisorStatus::Connecting),
            PeerState::Connected => Some(SupervisorStatus::Live),
            PeerState::Disconnected => Some(SupervisorStatus::Disconnected),
            PeerState::Failed => Some(SupervisorStatus::Failed),
            PeerState::Closed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub participant: ConnectionId,
    pub status: SupervisorStatus,
}

struct PeerContext {
    session: Arc<dyn PeerSession>,
    state: PeerState,
}

pub struct PeerManager {
    transport: Arc<dyn PeerTransport>,
    signaling: mpsc::UnboundedSender<ClientMessage>,
    status: mpsc::UnboundedSender<StatusUpdate>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    contexts: BTreeMap<ConnectionId, PeerContext>,
}

impl PeerManager {
    /// Returns the manager and the receiver its sessions report on. Feed that
    /// receiver back through [`PeerManager::handle_peer_event`].
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        signaling: mpsc::UnboundedSender<ClientMessage>,
        status: mpsc::UnboundedSender<StatusUpdate>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        let manager = Self {
            transport,
            signaling,
            status,
            peer_events,
            contexts: BTreeMap::new(),
        };
        (manager, peer_rx)
    }

    /// Starts negotiating with `participant`. Returns `false` when a live
    /// context already exists. A context whose transport was lost is replaced,
    /// which is how an operator retries.
    pub async fn observe(&mut self, participant: ConnectionId) -> Result<bool> {
        if let Some(context) = self.contexts.get(&participant) {
            if !context.state.is_lost() {
                tracing::debug!(participant = %participant, "Already observing participant");
                return Ok(false);
            }
            tracing::info!(participant = %participant, state = ?context.state, "Retrying lost participant");
            self.release(&participant).await;
        }

        let session = self
            .transport
            .create_session(participant.clone(), self.peer_events.clone())
            .await?;
        self.contexts.insert(
            participant.clone(),
            PeerContext {
                session: Arc::clone(&session),
                state: PeerState::New,
            },
        );

        let offer = match session.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.release(&participant).await;
                return Err(e);
            }
        };

        tracing::info!(participant = %participant, "Sending offer to participant");
        let sent = self.signaling.send(ClientMessage::Offer(SignalEnvelope {
            target: participant.clone(),
            payload: offer.to_payload(),
        }));
        if let Err(e) = sent {
            self.release(&participant).await;
            return Err(e.into());
        }
        self.report(&participant, SupervisorStatus::Connecting);
        Ok(true)
    }

    /// Dispatches an inbound relay message. Roster pushes release contexts
    /// for participants that left.
    pub async fn handle_signal(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Answer(signal) => self.handle_answer(signal).await,
            ServerMessage::IceCandidate(signal) => self.handle_ice(signal).await,
            ServerMessage::UserList(roster) => {
                self.sync_roster(&roster).await;
                Ok(())
            }
            other => {
                tracing::debug!(message = ?other, "Ignoring relay message");
                Ok(())
            }
        }
    }

    pub async fn handle_answer(&mut self, signal: ForwardedSignal) -> Result<()> {
        let Some(session) = self.session(&signal.source) else {
            tracing::debug!(source = %signal.source, "Answer from participant without context");
            return Ok(());
        };
        let answer = SessionDescription::from_payload(&signal.payload)?;
        session.set_remote_description(answer).await
    }

    pub async fn handle_ice(&mut self, signal: ForwardedSignal) -> Result<()> {
        let Some(session) = self.session(&signal.source) else {
            tracing::debug!(source = %signal.source, "ICE candidate from participant without context");
            return Ok(());
        };
        let candidate = IceCandidate::from_payload(&signal.payload)?;
        session.add_ice_candidate(candidate).await
    }

    /// Forwards local candidates to their participant and surfaces state changes.
    /// Lost connections are reported, never retried here.
    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate { peer, candidate } => {
                if !self.contexts.contains_key(&peer) {
                    return;
                }
                let sent = self.signaling.send(ClientMessage::IceCandidate(SignalEnvelope {
                    target: peer.clone(),
                    payload: candidate.to_payload(),
                }));
                if sent.is_err() {
                    tracing::warn!(participant = %peer, "Signaling channel closed, dropping local ICE candidate");
                }
            }
            PeerEvent::StateChanged { peer, state } => {
                let Some(context) = self.contexts.get_mut(&peer) else {
                    return;
                };
                context.state = state;
                if state.is_lost() {
                    tracing::warn!(participant = %peer, state = ?state, "Participant connection lost");
                } else {
                    tracing::info!(participant = %peer, state = ?state, "Participant connection state");
                }
                if let Some(status) = SupervisorStatus::from_peer_state(state) {
                    self.report(&peer, status);
                }
            }
        }
    }

    /// Closes and forgets the context for `participant`.
    pub async fn release(&mut self, participant: &ConnectionId) -> bool {
        match self.contexts.remove(participant) {
            Some(context) => {
                context.session.close().await;
                tracing::info!(participant = %participant, "Released participant context");
                true
            }
            None => false,
        }
    }

    /// Releases every context whose participant is no longer on the roster.
    pub async fn sync_roster(&mut self, roster: &Roster) -> Vec<ConnectionId> {
        let departed: Vec<ConnectionId> = self
            .contexts
            .keys()
            .filter(|id| !roster.contains_key(*id))
            .cloned()
            .collect();
        for id in &departed {
            self.release(id).await;
        }
        departed
    }

    pub async fn reset(&mut self) {
        let all: Vec<ConnectionId> = self.contexts.keys().cloned().collect();
        for id in &all {
            self.release(id).await;
        }
    }

    pub fn state(&self, participant: &ConnectionId) -> Option<PeerState> {
        self.contexts.get(participant).map(|c| c.state)
    }

    pub fn observed(&self) -> Vec<ConnectionId> {
        self.contexts.keys().cloned().collect()
    }

    fn session(&self, participant: &ConnectionId) -> Option<Arc<dyn PeerSession>> {
        self.contexts
            .get(participant)
            .map(|c| Arc::clone(&c.session))
    }

    fn report(&self, participant: &ConnectionId, status: SupervisorStatus) {
        let _ = self.status.send(StatusUpdate {
            participant: participant.clone(),
            status,
        });
    }
}
