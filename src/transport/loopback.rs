use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{IceCandidate, PeerEvent, PeerSession, PeerState, PeerTransport, SdpKind, SessionDescription};
use crate::compliance::CaptureStream;
use crate::error::{RelayError, Result};
use crate::relay::ConnectionId;

/// In-memory transport with no media path. A session reports `Connected` once
/// both its local and remote descriptions are installed, which is enough to
/// exercise the signaling flow end to end without a network.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    label: String,
    sessions: Arc<Mutex<Vec<Arc<LoopbackSession>>>>,
    counter: Arc<AtomicU64>,
}

impl LoopbackTransport {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    /// Every session created so far, including closed ones.
    pub fn sessions(&self) -> Vec<Arc<LoopbackSession>> {
        lock(&self.sessions).clone()
    }

    pub fn sessions_for(&self, remote: &ConnectionId) -> Vec<Arc<LoopbackSession>> {
        lock(&self.sessions)
            .iter()
            .filter(|s| &s.remote == remote)
            .cloned()
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_session(
        &self,
        remote: ConnectionId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>> {
        let serial = self.counter.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(LoopbackSession {
            label: format!("{}-{}", self.label, serial),
            remote,
            events,
            state: Mutex::new(LoopbackState::default()),
        });
        lock(&self.sessions).push(Arc::clone(&session));
        Ok(session)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    attached_tracks: usize,
    peer_state: Option<PeerState>,
    closed: bool,
}

pub struct LoopbackSession {
    label: String,
    remote: ConnectionId,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<LoopbackState>,
}

impl LoopbackSession {
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn state(&self) -> Option<PeerState> {
        lock(&self.state).peer_state
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).candidates.clone()
    }

    pub fn attached_tracks(&self) -> usize {
        lock(&self.state).attached_tracks
    }

    /// Simulates the transport dropping, as a network failure would.
    pub fn fail(&self) {
        self.transition(PeerState::Failed);
    }

    fn transition(&self, next: PeerState) {
        {
            let mut state = lock(&self.state);
            if state.closed || state.peer_state == Some(next) {
                return;
            }
            state.peer_state = Some(next);
        }
        let _ = self.events.send(PeerEvent::StateChanged {
            peer: self.remote.clone(),
            state: next,
        });
    }

    fn install_local(&self, description: SessionDescription) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(RelayError::internal("session closed"));
            }
            state.local = Some(description);
        }
        let _ = self.events.send(PeerEvent::IceCandidate {
            peer: self.remote.clone(),
            candidate: IceCandidate {
                candidate: format!("candidate:{} 1 udp 2130706431 127.0.0.1 9 typ host", self.label),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        });
        self.maybe_connect();
        Ok(())
    }

    fn maybe_connect(&self) {
        let ready = {
            let state = lock(&self.state);
            state.local.is_some() && state.remote.is_some()
        };
        if ready {
            self.transition(PeerState::Connecting);
            self.transition(PeerState::Connected);
        }
    }
}

#[async_trait]
impl PeerSession for LoopbackSession {
    fn remote(&self) -> &ConnectionId {
        &self.remote
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = SessionDescription::offer(format!("v=0 o={} loopback-offer", self.label));
        self.install_local(offer.clone())?;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let has_offer = matches!(
            lock(&self.state).remote.as_ref().map(|d| d.kind),
            Some(SdpKind::Offer)
        );
        if !has_offer {
            return Err(RelayError::CreateAnswerFailed("no remote offer applied".to_string()));
        }

        let answer = SessionDescription::answer(format!("v=0 o={} loopback-answer", self.label));
        self.install_local(answer.clone())?;
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(RelayError::SetRemoteDescriptionFailed("session closed".to_string()));
            }
            state.remote = Some(description);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            return Err(RelayError::AddIceCandidateFailed(
                "remote description not set".to_string(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn attach_stream(&self, stream: &CaptureStream) -> Result<()> {
        lock(&self.state).attached_tracks += stream.tracks().len();
        Ok(())
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.peer_state = Some(PeerState::Closed);
    }
}
