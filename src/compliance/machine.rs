use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::capture::{CaptureError, CaptureProvider, CaptureStream, MediaTrack, TrackKind};
use super::violation::{Notice, PageEvent, TerminationCause, Violation};
use crate::config::ComplianceConfig;
use crate::error::{RelayError, Result};
use crate::relay::{ClientMessage, ConnectionId, ForwardedSignal, ServerMessage, SignalEnvelope};
use crate::transport::{IceCandidate, PeerEvent, PeerSession, PeerState, PeerTransport, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExamPhase {
    Idle,
    AcquiringPermissions,
    Active,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Clear,
    Caution,
    Danger,
}

/// Observable state of the participant's exam session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceSnapshot {
    pub phase: ExamPhase,
    pub name: Option<String>,
    pub warnings: u32,
    pub max_warnings: u32,
    pub peer_state: Option<PeerState>,
}

impl ComplianceSnapshot {
    fn idle(max_warnings: u32) -> Self {
        Self {
            phase: ExamPhase::Idle,
            name: None,
            warnings: 0,
            max_warnings,
            peer_state: None,
        }
    }

    pub fn severity(&self) -> Severity {
        if self.warnings == 0 {
            Severity::Clear
        } else if self.warnings + 1 >= self.max_warnings {
            Severity::Danger
        } else {
            Severity::Caution
        }
    }
}

/// Inputs to the compliance machine.
#[derive(Debug, Clone)]
pub enum ComplianceEvent {
    /// The participant pressed start.
    Start { name: String },
    Page(PageEvent),
    /// Periodic compulsory-resource check.
    Poll,
    /// Inbound frame from the relay.
    Signal(ServerMessage),
    Peer(PeerEvent),
    SignalingLost,
    ResetElapsed,
    /// The participant ended the exam themselves.
    EndRequested,
}

impl ComplianceEvent {
    /// Events that can only end in termination are processed ahead of the rest of their tick.
    pub fn is_compulsory(&self) -> bool {
        match self {
            ComplianceEvent::Poll | ComplianceEvent::SignalingLost => true,
            ComplianceEvent::Page(page) => page.classify().map_or(false, |v| v.is_compulsory()),
            _ => false,
        }
    }
}

/// Platform surface the machine reports to: blocking alerts and fullscreen control.
#[async_trait]
pub trait ExamHost: Send + Sync {
    /// Shows the notice and returns once the participant has acknowledged it.
    async fn alert(&self, notice: &Notice);

    /// Best-effort; returns whether fullscreen was entered.
    async fn request_fullscreen(&self) -> bool;

    async fn exit_fullscreen(&self);
}

/// Host that logs notices and records them for later inspection.
#[derive(Debug, Default)]
pub struct RecordingHost {
    notices: Mutex<Vec<Notice>>,
    fullscreen: AtomicBool,
    fullscreen_requests: AtomicU32,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen.load(Ordering::SeqCst)
    }

    pub fn fullscreen_requests(&self) -> u32 {
        self.fullscreen_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExamHost for RecordingHost {
    async fn alert(&self, notice: &Notice) {
        if notice.is_fatal() {
            tracing::warn!(notice = %notice, "Participant notice");
        } else {
            tracing::info!(notice = %notice, "Participant notice");
        }
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notice.clone());
    }

    async fn request_fullscreen(&self) -> bool {
        self.fullscreen_requests.fetch_add(1, Ordering::SeqCst);
        self.fullscreen.store(true, Ordering::SeqCst);
        true
    }

    async fn exit_fullscreen(&self) {
        self.fullscreen.store(false, Ordering::SeqCst);
    }
}

/// Floor for recurring periods; `tokio::time::interval` rejects zero.
pub const MIN_CHECK_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a background task feeding the machine. Cancelled explicitly when
/// leaving Active, and on drop.
#[derive(Debug)]
pub struct RecurringCheck {
    task: JoinHandle<()>,
}

impl RecurringCheck {
    /// Sends `event` every `period`, starting one period from now.
    pub fn every(period: Duration, events: mpsc::UnboundedSender<ComplianceEvent>, event: ComplianceEvent) -> Self {
        let period = period.max(MIN_CHECK_PERIOD);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if events.send(event.clone()).is_err() {
                    break;
                }
            }
        });
        Self { task }
    }

    /// Sends `event` once after `delay`.
    pub fn after(delay: Duration, events: mpsc::UnboundedSender<ComplianceEvent>, event: ComplianceEvent) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
        Self { task }
    }

    /// Reports the first time `track` ends or is disabled.
    pub fn watch_track(track: Arc<dyn MediaTrack>, events: mpsc::UnboundedSender<ComplianceEvent>) -> Self {
        let kind = track.kind();
        let mut status = track.subscribe();
        let task = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow();
                let page = if !current.is_live() {
                    PageEvent::TrackEnded(kind)
                } else if !current.enabled {
                    PageEvent::TrackDisabled(kind)
                } else {
                    continue;
                };
                let _ = events.send(ComplianceEvent::Page(page));
                break;
            }
        });
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for RecurringCheck {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cloneable front door to a running [`ComplianceMachine`].
#[derive(Clone)]
pub struct ComplianceHandle {
    events: mpsc::UnboundedSender<ComplianceEvent>,
    snapshot: watch::Receiver<ComplianceSnapshot>,
}

impl ComplianceHandle {
    pub fn send(&self, event: ComplianceEvent) -> Result<()> {
        self.events.send(event).map_err(|_| RelayError::ChannelClosed)
    }

    pub fn start(&self, name: impl Into<String>) -> Result<()> {
        self.send(ComplianceEvent::Start { name: name.into() })
    }

    pub fn page(&self, event: PageEvent) -> Result<()> {
        self.send(ComplianceEvent::Page(event))
    }

    pub fn signal(&self, message: ServerMessage) -> Result<()> {
        self.send(ComplianceEvent::Signal(message))
    }

    pub fn signaling_lost(&self) -> Result<()> {
        self.send(ComplianceEvent::SignalingLost)
    }

    pub fn end_exam(&self) -> Result<()> {
        self.send(ComplianceEvent::EndRequested)
    }

    pub fn snapshot(&self) -> ComplianceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ComplianceSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<ComplianceSnapshot>
    where
        F: Fn(&ComplianceSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&*current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| RelayError::ChannelClosed)?;
        }
    }
}

/// Receiving side of the machine's inputs.
pub struct ComplianceInbox {
    external: mpsc::UnboundedReceiver<ComplianceEvent>,
    internal: mpsc::UnboundedReceiver<ComplianceEvent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl ComplianceInbox {
    /// Waits for the next event, then drains everything already pending into
    /// one tick. Returns `None` once every [`ComplianceHandle`] is gone.
    pub async fn next_tick(&mut self) -> Option<Vec<ComplianceEvent>> {
        let first = tokio::select! {
            biased;
            event = self.external.recv() => event?,
            Some(event) = self.internal.recv() => event,
            Some(event) = self.peer_events.recv() => ComplianceEvent::Peer(event),
        };

        let mut tick = vec![first];
        while let Ok(event) = self.external.try_recv() {
            tick.push(event);
        }
        while let Ok(event) = self.internal.try_recv() {
            tick.push(event);
        }
        while let Ok(event) = self.peer_events.try_recv() {
            tick.push(ComplianceEvent::Peer(event));
        }
        Some(tick)
    }
}

/// Participant-side exam state machine: `Idle -> AcquiringPermissions -> Active -> Terminated -> Idle`.
pub struct ComplianceMachine {
    config: ComplianceConfig,
    capture: Arc<dyn CaptureProvider>,
    transport: Arc<dyn PeerTransport>,
    host: Arc<dyn ExamHost>,
    signaling: mpsc::UnboundedSender<ClientMessage>,

    internal: mpsc::UnboundedSender<ComplianceEvent>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    snapshot: watch::Sender<ComplianceSnapshot>,

    phase: ExamPhase,
    name: Option<String>,
    warnings: u32,
    stream: Option<CaptureStream>,
    screen: Option<Arc<dyn MediaTrack>>,
    microphone: Option<Arc<dyn MediaTrack>>,
    peer: Option<Arc<dyn PeerSession>>,
    peer_state: Option<PeerState>,
    checks: Vec<RecurringCheck>,
    reset: Option<RecurringCheck>,
}

impl ComplianceMachine {
    pub fn new(
        config: ComplianceConfig,
        capture: Arc<dyn CaptureProvider>,
        transport: Arc<dyn PeerTransport>,
        host: Arc<dyn ExamHost>,
        signaling: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, ComplianceInbox, ComplianceHandle) {
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ComplianceSnapshot::idle(config.max_warnings));

        let machine = Self {
            config,
            capture,
            transport,
            host,
            signaling,
            internal: internal_tx,
            peer_events: peer_tx,
            snapshot: snapshot_tx,
            phase: ExamPhase::Idle,
            name: None,
            warnings: 0,
            stream: None,
            screen: None,
            microphone: None,
            peer: None,
            peer_state: None,
            checks: Vec::new(),
            reset: None,
        };
        let inbox = ComplianceInbox {
            external: external_rx,
            internal: internal_rx,
            peer_events: peer_rx,
        };
        let handle = ComplianceHandle {
            events: external_tx,
            snapshot: snapshot_rx,
        };
        (machine, inbox, handle)
    }

    /// Builds the machine and drives it on a background task.
    pub fn spawn(
        config: ComplianceConfig,
        capture: Arc<dyn CaptureProvider>,
        transport: Arc<dyn PeerTransport>,
        host: Arc<dyn ExamHost>,
        signaling: mpsc::UnboundedSender<ClientMessage>,
    ) -> (ComplianceHandle, JoinHandle<()>) {
        let (machine, inbox, handle) = Self::new(config, capture, transport, host, signaling);
        let task = tokio::spawn(machine.run(inbox));
        (handle, task)
    }

    pub async fn run(mut self, mut inbox: ComplianceInbox) {
        while let Some(tick) = inbox.next_tick().await {
            self.process_tick(tick).await;
        }
        self.shutdown().await;
    }

    pub fn phase(&self) -> ExamPhase {
        self.phase
    }

    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    /// Number of background checks still running.
    pub fn active_checks(&self) -> usize {
        self.checks.iter().filter(|c| c.is_running()).count()
    }

    pub fn subscribe(&self) -> watch::Receiver<ComplianceSnapshot> {
        self.snapshot.subscribe()
    }

    /// Handles one batch of events, compulsory ones first.
    pub async fn process_tick(&mut self, mut events: Vec<ComplianceEvent>) {
        events.sort_by_key(|event| !event.is_compulsory());
        for event in events {
            self.handle(event).await;
        }
    }

    pub async fn handle(&mut self, event: ComplianceEvent) {
        match event {
            ComplianceEvent::Start { name } => self.start(name).await,
            ComplianceEvent::Page(page) => self.on_page_event(page).await,
            ComplianceEvent::Poll => {
                if self.phase == ExamPhase::Active {
                    if let Some(violation) = self.inspect_resources() {
                        self.terminate(TerminationCause::Compulsory(violation)).await;
                    }
                }
            }
            ComplianceEvent::Signal(message) => self.on_signal(message).await,
            ComplianceEvent::Peer(event) => self.on_peer_event(event),
            ComplianceEvent::SignalingLost => {
                self.terminate(TerminationCause::Compulsory(Violation::SignalingLost))
                    .await;
            }
            ComplianceEvent::ResetElapsed => self.reset(),
            ComplianceEvent::EndRequested => {
                self.terminate(TerminationCause::EndedByParticipant).await;
            }
        }
    }

    async fn start(&mut self, name: String) {
        if self.phase != ExamPhase::Idle {
            tracing::debug!(phase = ?self.phase, "Ignoring start outside Idle");
            return;
        }

        let name = name.trim().to_string();
        if name.is_empty() {
            self.host.alert(&Notice::NameRequired).await;
            return;
        }

        self.phase = ExamPhase::AcquiringPermissions;
        self.warnings = 0;
        self.name = Some(name.clone());
        self.publish();
        tracing::info!(name = %name, "Acquiring capture permissions");

        match self.acquire().await {
            Ok(stream) => self.enter_active(name, stream).await,
            Err(notice) => {
                self.host.alert(&notice).await;
                self.phase = ExamPhase::Idle;
                self.name = None;
                self.publish();
                tracing::info!(notice = %notice, "Exam start aborted");
            }
        }
    }

    /// Screen first, then microphone. Any failure releases whatever was captured.
    async fn acquire(&self) -> std::result::Result<CaptureStream, Notice> {
        let mut stream = self
            .capture
            .request_screen()
            .await
            .map_err(Notice::ScreenUnavailable)?;

        let Some(video) = stream.first_of(TrackKind::Video) else {
            stream.stop_all();
            return Err(Notice::ScreenUnavailable(CaptureError::NoDevice));
        };
        if let Some(surface) = video.status().surface {
            if !surface.is_entire_screen() {
                stream.stop_all();
                return Err(Notice::WrongSurface(surface));
            }
        }

        let microphone = match self.capture.request_microphone().await {
            Ok(mic) => mic,
            Err(e) => {
                stream.stop_all();
                return Err(Notice::MicrophoneUnavailable(e));
            }
        };
        if microphone.first_of(TrackKind::Audio).is_none() {
            microphone.stop_all();
            stream.stop_all();
            return Err(Notice::MicrophoneUnavailable(CaptureError::NoDevice));
        }

        for track in microphone.tracks() {
            stream.add_track(Arc::clone(track));
        }
        Ok(stream)
    }

    async fn enter_active(&mut self, name: String, stream: CaptureStream) {
        self.screen = stream.first_of(TrackKind::Video);
        self.microphone = stream.first_of(TrackKind::Audio);

        for track in self.screen.iter().chain(self.microphone.iter()) {
            self.checks
                .push(RecurringCheck::watch_track(Arc::clone(track), self.internal.clone()));
        }
        self.checks.push(RecurringCheck::every(
            self.config.check_interval,
            self.internal.clone(),
            ComplianceEvent::Poll,
        ));

        self.stream = Some(stream);
        self.phase = ExamPhase::Active;
        self.publish();
        tracing::info!(name = %name, "Exam active");

        if !self.emit(ClientMessage::JoinExam(name)) {
            self.terminate(TerminationCause::Compulsory(Violation::SignalingLost))
                .await;
            return;
        }
        if !self.host.request_fullscreen().await {
            tracing::debug!("Fullscreen request refused");
        }
    }

    async fn on_page_event(&mut self, page: PageEvent) {
        if self.phase != ExamPhase::Active {
            return;
        }
        let Some(violation) = page.classify() else {
            return;
        };

        if violation.is_compulsory() {
            self.terminate(TerminationCause::Compulsory(violation)).await;
        } else {
            self.warn(violation).await;
        }
    }

    async fn warn(&mut self, violation: Violation) {
        self.warnings += 1;
        self.publish();
        tracing::info!(
            violation = %violation,
            warnings = self.warnings,
            max = self.config.max_warnings,
            "Warning recorded"
        );

        self.host
            .alert(&Notice::Warning {
                violation,
                count: self.warnings,
                max: self.config.max_warnings,
            })
            .await;

        if self.warnings >= self.config.max_warnings {
            self.terminate(TerminationCause::WarningLimit(violation)).await;
        } else if violation == Violation::FullscreenExit {
            self.host.request_fullscreen().await;
        }
    }

    fn inspect_resources(&self) -> Option<Violation> {
        let screen = match &self.screen {
            Some(track) => track.status(),
            None => return Some(Violation::ScreenNotLive),
        };
        if !screen.is_live() || !screen.enabled {
            return Some(Violation::ScreenNotLive);
        }

        match &self.microphone {
            Some(track) => {
                let mic = track.status();
                if !mic.is_live() || !mic.enabled {
                    return Some(Violation::MicrophoneNotLive);
                }
            }
            None => return Some(Violation::MicrophoneNotLive),
        }

        match screen.surface {
            Some(surface) if !surface.is_entire_screen() => Some(Violation::SurfaceChanged(surface)),
            _ => None,
        }
    }

    /// Ends the active session. Safe to call repeatedly; only the first call from Active acts.
    async fn terminate(&mut self, cause: TerminationCause) {
        if self.phase != ExamPhase::Active {
            return;
        }

        self.host.alert(&Notice::Terminated(cause)).await;
        tracing::info!(cause = %cause, warnings = self.warnings, "Exam terminated");

        self.phase = ExamPhase::Terminated;
        for check in self.checks.drain(..) {
            check.cancel();
        }
        self.release_capture();
        self.close_peer().await;
        self.emit(ClientMessage::EndExam);
        self.host.exit_fullscreen().await;
        self.reset = Some(RecurringCheck::after(
            self.config.reset_delay,
            self.internal.clone(),
            ComplianceEvent::ResetElapsed,
        ));
        self.publish();
    }

    fn reset(&mut self) {
        if self.phase != ExamPhase::Terminated {
            return;
        }
        self.reset = None;
        self.phase = ExamPhase::Idle;
        self.name = None;
        self.warnings = 0;
        self.peer_state = None;
        self.publish();
        tracing::info!("Exam state reset");
    }

    async fn shutdown(&mut self) {
        for check in self.checks.drain(..) {
            check.cancel();
        }
        self.reset = None;
        self.release_capture();
        self.close_peer().await;
    }

    fn release_capture(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
        }
        self.screen = None;
        self.microphone = None;
    }

    async fn close_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
    }

    async fn on_signal(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Offer(signal) => {
                if self.phase != ExamPhase::Active {
                    tracing::debug!(source = %signal.source, "Ignoring offer outside an active exam");
                    return;
                }
                let source = signal.source.clone();
                if let Err(e) = self.answer_offer(signal).await {
                    tracing::error!(source = %source, error = %e, "Failed to answer offer");
                    self.close_peer().await;
                }
            }
            ServerMessage::IceCandidate(signal) => self.apply_remote_candidate(signal).await,
            ServerMessage::Error(message) => {
                tracing::warn!(message = %message, "Relay reported an error");
            }
            other => {
                tracing::debug!(message = ?other, "Ignoring relay message");
            }
        }
    }

    async fn answer_offer(&mut self, signal: ForwardedSignal) -> Result<()> {
        let offer = SessionDescription::from_payload(&signal.payload)?;
        let Some(stream) = self.stream.clone() else {
            return Err(RelayError::internal("no capture stream to publish"));
        };

        self.close_peer().await;
        let session = self
            .transport
            .create_session(signal.source.clone(), self.peer_events.clone())
            .await?;
        self.peer = Some(Arc::clone(&session));
        self.peer_state = None;

        session.attach_stream(&stream).await?;
        session.set_remote_description(offer).await?;
        let answer = session.create_answer().await?;

        tracing::info!(supervisor = %signal.source, "Answering supervisor offer");
        self.emit(ClientMessage::Answer(SignalEnvelope {
            target: signal.source,
            payload: answer.to_payload(),
        }));
        Ok(())
    }

    async fn apply_remote_candidate(&mut self, signal: ForwardedSignal) {
        let Some(peer) = self.current_peer(&signal.source) else {
            tracing::debug!(source = %signal.source, "Dropping ICE candidate for unknown peer");
            return;
        };
        let result = match IceCandidate::from_payload(&signal.payload) {
            Ok(candidate) => peer.add_ice_candidate(candidate).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(source = %signal.source, error = %e, "Failed to apply ICE candidate");
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        if self.current_peer(event.peer()).is_none() {
            return;
        }
        match event {
            PeerEvent::IceCandidate { peer, candidate } => {
                self.emit(ClientMessage::IceCandidate(SignalEnvelope {
                    target: peer,
                    payload: candidate.to_payload(),
                }));
            }
            PeerEvent::StateChanged { peer, state } => {
                if state.is_lost() {
                    tracing::warn!(supervisor = %peer, state = ?state, "Peer connection lost");
                } else {
                    tracing::info!(supervisor = %peer, state = ?state, "Peer connection state");
                }
                self.peer_state = Some(state);
                self.publish();
            }
        }
    }

    fn current_peer(&self, remote: &ConnectionId) -> Option<Arc<dyn PeerSession>> {
        self.peer
            .as_ref()
            .filter(|peer| peer.remote() == remote)
            .cloned()
    }

    fn emit(&self, message: ClientMessage) -> bool {
        match self.signaling.send(message) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!("Signaling channel closed");
                false
            }
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(ComplianceSnapshot {
            phase: self.phase,
            name: self.name.clone(),
            warnings: self.warnings,
            max_warnings: self.config.max_warnings,
            peer_state: self.peer_state,
        });
    }
}
