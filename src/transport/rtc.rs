use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{IceCandidate, PeerEvent, PeerSession, PeerState, PeerTransport, SdpKind, SessionDescription};
use crate::compliance::{CaptureStream, TrackKind};
use crate::config::IceConfig;
use crate::error::{RelayError, Result};
use crate::relay::ConnectionId;

const CAPTURE_STREAM_ID: &str = "exam-capture";

fn video_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "".to_string(),
        rtcp_feedback: vec![
            RTCPFeedback {
                typ: "goog-remb".to_string(),
                parameter: "".to_string(),
            },
            RTCPFeedback {
                typ: "ccm".to_string(),
                parameter: "fir".to_string(),
            },
            RTCPFeedback {
                typ: "nack".to_string(),
                parameter: "".to_string(),
            },
            RTCPFeedback {
                typ: "nack".to_string(),
                parameter: "pli".to_string(),
            },
        ],
    }
}

fn audio_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

fn create_webrtc_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: video_capability(),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: audio_capability(),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    // IPv4 only, no mDNS candidates
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
    setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

/// Media transport backed by the `webrtc` crate.
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransport {
    pub fn new(ice: &IceConfig) -> Result<Self> {
        let ice_servers = ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api: create_webrtc_api()?,
            ice_servers,
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_session(
        &self,
        remote: ConnectionId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| RelayError::PeerConnectionCreation(e.to_string()))?,
        );

        {
            let peer = remote.clone();
            let events = events.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate| {
                let peer = peer.clone();
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerEvent::IceCandidate {
                                peer,
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            });
                        }
                        Err(e) => {
                            tracing::error!(peer = %peer, error = %e, "Failed to serialize local ICE candidate");
                        }
                    }
                })
            }));
        }

        {
            let peer = remote.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                let peer = peer.clone();
                let events = events.clone();
                Box::pin(async move {
                    tracing::info!(peer = %peer, state = %state, "Peer connection state changed");
                    let _ = events.send(PeerEvent::StateChanged {
                        peer,
                        state: map_state(state),
                    });
                })
            }));
        }

        Ok(Arc::new(WebRtcSession {
            remote,
            peer_connection,
            local_tracks: Mutex::new(Vec::new()),
        }))
    }
}

pub struct WebRtcSession {
    remote: ConnectionId,
    peer_connection: Arc<RTCPeerConnection>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl WebRtcSession {
    /// Sample sinks for the attached capture tracks, for the capture pipeline to feed.
    pub async fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().await.clone()
    }
}

#[async_trait]
impl PeerSession for WebRtcSession {
    fn remote(&self) -> &ConnectionId {
        &self.remote
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.peer_connection.get_transceivers().await.is_empty() {
            self.peer_connection
                .add_transceiver_from_kind(RTPCodecType::Video, None)
                .await?;
            self.peer_connection
                .add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await?;
        }

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| RelayError::CreateOfferFailed(e.to_string()))?;
        self.peer_connection.set_local_description(offer.clone()).await?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| RelayError::CreateAnswerFailed(e.to_string()))?;
        self.peer_connection.set_local_description(answer.clone()).await?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| RelayError::InvalidSdp(e.to_string()))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| RelayError::SetRemoteDescriptionFailed(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| RelayError::AddIceCandidateFailed(e.to_string()))
    }

    async fn attach_stream(&self, stream: &CaptureStream) -> Result<()> {
        let mut local_tracks = self.local_tracks.lock().await;

        for track in stream.tracks() {
            let capability = match track.kind() {
                TrackKind::Video => video_capability(),
                TrackKind::Audio => audio_capability(),
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id().to_string(),
                CAPTURE_STREAM_ID.to_string(),
            ));

            self.peer_connection
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| RelayError::AttachStreamFailed(e.to_string()))?;
            local_tracks.push(local);
        }

        tracing::debug!(peer = %self.remote, tracks = local_tracks.len(), "Attached capture stream");
        Ok(())
    }

    async fn close(&self) {
        tracing::info!(peer = %self.remote, "Closing peer connection");
        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!(peer = %self.remote, error = %e, "Error while closing peer connection");
        }
    }
}
