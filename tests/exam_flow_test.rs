// Participant and supervisor sessions against an in-process relay

mod common;

use std::sync::Arc;

use common::{TestRelay, WAIT};
use proctor_relay::client::{ParticipantSession, SupervisorSession};
use proctor_relay::compliance::{
    CaptureError, ComplianceSnapshot, DisplaySurface, ExamPhase, MediaTrack, Notice, PageEvent,
    RecordingHost, SimulatedCapture, TerminationCause, TrackKind, Violation,
};
use proctor_relay::config::{ComplianceConfig, SupervisorConfig};
use proctor_relay::supervisor::SupervisorStatus;
use proctor_relay::transport::{LoopbackTransport, PeerState};

struct Participant {
    session: ParticipantSession,
    capture: Arc<SimulatedCapture>,
    transport: LoopbackTransport,
    host: Arc<RecordingHost>,
}

impl Participant {
    async fn connect(relay: &TestRelay, capture: SimulatedCapture) -> Self {
        let capture = Arc::new(capture);
        let transport = LoopbackTransport::new("participant");
        let host = Arc::new(RecordingHost::new());
        let session = ParticipantSession::spawn(
            relay.client().await,
            ComplianceConfig::default(),
            capture.clone(),
            Arc::new(transport.clone()),
            host.clone(),
        );
        Self {
            session,
            capture,
            transport,
            host,
        }
    }

    async fn wait_for<F>(&self, predicate: F) -> ComplianceSnapshot
    where
        F: Fn(&ComplianceSnapshot) -> bool,
    {
        tokio::time::timeout(WAIT, self.session.handle().wait_for(predicate))
            .await
            .expect("snapshot within deadline")
            .expect("machine still running")
    }

    async fn join(&self, name: &str) -> ComplianceSnapshot {
        self.session.handle().start(name).unwrap();
        self.wait_for(|s| s.phase == ExamPhase::Active).await
    }
}

async fn supervisor(relay: &TestRelay) -> SupervisorSession {
    let (client, roster) = relay.supervisor().await;
    SupervisorSession::spawn(
        client,
        roster,
        SupervisorConfig::default(),
        Arc::new(LoopbackTransport::new("supervisor")),
    )
}

/// Join, observe, then stop sharing: the supervisor loses the participant.
#[tokio::test]
async fn test_observed_participant_terminates_on_screen_stop() {
    let relay = TestRelay::start().await;
    let mut supervisor = supervisor(&relay).await;
    let alice = Participant::connect(&relay, SimulatedCapture::granting(DisplaySurface::Monitor)).await;
    let alice_id = alice.session.id().clone();

    let snapshot = alice.join("Alice").await;
    assert_eq!(snapshot.name.as_deref(), Some("Alice"));
    assert!(alice.host.is_fullscreen());

    let roster = supervisor
        .wait_for_roster(WAIT, |r| r.contains_key(&alice_id))
        .await
        .unwrap();
    assert_eq!(roster.get(&alice_id).map(String::as_str), Some("Alice"));

    supervisor.observe(alice_id.clone()).unwrap();
    supervisor
        .wait_for_status(&alice_id, SupervisorStatus::Live, WAIT)
        .await
        .unwrap();
    alice
        .wait_for(|s| s.peer_state == Some(PeerState::Connected))
        .await;

    let sessions = alice.transport.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].attached_tracks(), 2);

    alice.capture.latest(TrackKind::Video).unwrap().end();

    let snapshot = alice.wait_for(|s| s.phase == ExamPhase::Terminated).await;
    assert_eq!(snapshot.warnings, 0);
    assert!(alice.host.notices().contains(&Notice::Terminated(
        TerminationCause::Compulsory(Violation::TrackEnded(TrackKind::Video))
    )));

    supervisor
        .wait_for_roster(WAIT, |r| !r.contains_key(&alice_id))
        .await
        .unwrap();
    supervisor
        .wait_for_observed(WAIT, |observed| observed.is_empty())
        .await
        .unwrap();

    assert!(sessions[0].is_closed());
    assert!(alice
        .capture
        .issued()
        .iter()
        .all(|track| !track.status().is_live()));

    alice.wait_for(|s| s.phase == ExamPhase::Idle).await;
    alice.session.shutdown().await;
    supervisor.shutdown().await;
}

/// Three warning-level violations end the exam on the third.
#[tokio::test]
async fn test_warning_limit_terminates_exam() {
    let relay = TestRelay::start().await;
    let supervisor = supervisor(&relay).await;
    let bob = Participant::connect(&relay, SimulatedCapture::granting(DisplaySurface::Monitor)).await;
    let bob_id = bob.session.id().clone();
    bob.join("Bob").await;
    supervisor
        .wait_for_roster(WAIT, |r| r.contains_key(&bob_id))
        .await
        .unwrap();

    for _ in 0..3 {
        bob.session
            .handle()
            .page(PageEvent::WindowBlurred {
                document_hidden: false,
            })
            .unwrap();
    }

    let snapshot = bob.wait_for(|s| s.phase == ExamPhase::Terminated).await;
    assert_eq!(snapshot.warnings, 3);

    let notices = bob.host.notices();
    assert!(notices.contains(&Notice::Warning {
        violation: Violation::WindowBlur,
        count: 2,
        max: 3,
    }));
    assert_eq!(
        notices.last(),
        Some(&Notice::Terminated(TerminationCause::WarningLimit(
            Violation::WindowBlur
        )))
    );

    supervisor
        .wait_for_roster(WAIT, |r| !r.contains_key(&bob_id))
        .await
        .unwrap();
    bob.session.shutdown().await;
    supervisor.shutdown().await;
}

/// A blank name never leaves idle and never reaches the roster.
#[tokio::test]
async fn test_blank_name_stays_idle() {
    let relay = TestRelay::start().await;
    let carol = Participant::connect(&relay, SimulatedCapture::granting(DisplaySurface::Monitor)).await;

    carol.session.handle().start("   ").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(carol.session.handle().snapshot().phase, ExamPhase::Idle);
    assert_eq!(carol.host.notices(), vec![Notice::NameRequired]);
    assert!(carol.capture.issued().is_empty());

    let (_client, roster) = relay.supervisor().await;
    assert!(roster.is_empty());
    carol.session.shutdown().await;
}

/// Sharing a window instead of the whole screen is refused and released.
#[tokio::test]
async fn test_wrong_surface_releases_capture() {
    let relay = TestRelay::start().await;
    let dave = Participant::connect(&relay, SimulatedCapture::granting(DisplaySurface::Window)).await;

    dave.session.handle().start("Dave").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(dave.session.handle().snapshot().phase, ExamPhase::Idle);
    assert_eq!(
        dave.host.notices(),
        vec![Notice::WrongSurface(DisplaySurface::Window)]
    );
    let issued = dave.capture.issued();
    assert_eq!(issued.len(), 1);
    assert!(!issued[0].status().is_live());

    let (_client, roster) = relay.supervisor().await;
    assert!(roster.is_empty());
    dave.session.shutdown().await;
}

/// A denied microphone leaves the participant idle with nothing held.
#[tokio::test]
async fn test_denied_microphone_releases_screen() {
    let relay = TestRelay::start().await;
    let erin = Participant::connect(
        &relay,
        SimulatedCapture::granting(DisplaySurface::Monitor).deny_microphone(CaptureError::PermissionDenied),
    )
    .await;

    erin.session.handle().start("Erin").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(erin.session.handle().snapshot().phase, ExamPhase::Idle);
    assert_eq!(
        erin.host.notices(),
        vec![Notice::MicrophoneUnavailable(CaptureError::PermissionDenied)]
    );
    assert!(erin
        .capture
        .issued()
        .iter()
        .all(|track| !track.status().is_live()));
    erin.session.shutdown().await;
}
