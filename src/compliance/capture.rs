use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn label(&self) -> &'static str {
        match self {
            TrackKind::Video => "Screen sharing",
            TrackKind::Audio => "Microphone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Live,
    Ended,
}

/// What a screen capture is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplaySurface {
    Monitor,
    Window,
    Browser,
}

impl DisplaySurface {
    pub fn is_entire_screen(&self) -> bool {
        matches!(self, DisplaySurface::Monitor)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplaySurface::Monitor => "monitor",
            DisplaySurface::Window => "window",
            DisplaySurface::Browser => "browser",
        }
    }
}

impl fmt::Display for DisplaySurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackStatus {
    pub ready_state: ReadyState,
    pub enabled: bool,
    /// Only reported by screen-capture tracks.
    pub surface: Option<DisplaySurface>,
}

impl TrackStatus {
    pub fn live(surface: Option<DisplaySurface>) -> Self {
        Self {
            ready_state: ReadyState::Live,
            enabled: true,
            surface,
        }
    }

    pub fn is_live(&self) -> bool {
        self.ready_state == ReadyState::Live
    }
}

/// A platform capture track. Status changes are observable through `subscribe`.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn status(&self) -> TrackStatus;
    fn subscribe(&self) -> watch::Receiver<TrackStatus>;
    /// Releases the underlying device. Idempotent.
    fn stop(&self);
}

/// Ordered set of capture tracks that travel together.
#[derive(Debug, Clone, Default)]
pub struct CaptureStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl CaptureStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn first_of(&self, kind: TrackKind) -> Option<Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn has_live_tracks(&self) -> bool {
        self.tracks.iter().any(|t| t.status().is_live())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("No capture device found")]
    NoDevice,

    #[error("Capture failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Asks for an entire-screen video capture. The user may still pick another surface.
    async fn request_screen(&self) -> Result<CaptureStream, CaptureError>;

    async fn request_microphone(&self) -> Result<CaptureStream, CaptureError>;
}

static NEXT_TRACK: AtomicU64 = AtomicU64::new(1);

/// Track whose status is driven by the caller. Used by the CLI participant and tests.
#[derive(Debug)]
pub struct SimulatedTrack {
    id: String,
    kind: TrackKind,
    status: watch::Sender<TrackStatus>,
}

impl SimulatedTrack {
    fn with_status(kind: TrackKind, status: TrackStatus) -> Arc<Self> {
        let serial = NEXT_TRACK.fetch_add(1, Ordering::Relaxed);
        let prefix = match kind {
            TrackKind::Video => "screen",
            TrackKind::Audio => "mic",
        };
        let (tx, _rx) = watch::channel(status);
        Arc::new(Self {
            id: format!("{}-{}", prefix, serial),
            kind,
            status: tx,
        })
    }

    pub fn screen(surface: DisplaySurface) -> Arc<Self> {
        Self::with_status(TrackKind::Video, TrackStatus::live(Some(surface)))
    }

    pub fn microphone() -> Arc<Self> {
        Self::with_status(TrackKind::Audio, TrackStatus::live(None))
    }

    /// The user stopped sharing from the browser/OS controls.
    pub fn end(&self) {
        self.status.send_modify(|s| s.ready_state = ReadyState::Ended);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.status.send_modify(|s| s.enabled = enabled);
    }

    pub fn set_surface(&self, surface: DisplaySurface) {
        self.status.send_modify(|s| s.surface = Some(surface));
    }

    /// Changes the status without notifying subscribers, so only polling sees it.
    pub fn set_silently(&self, status: TrackStatus) {
        self.status.send_if_modified(|s| {
            *s = status;
            false
        });
    }
}

impl MediaTrack for SimulatedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn status(&self) -> TrackStatus {
        *self.status.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<TrackStatus> {
        self.status.subscribe()
    }

    fn stop(&self) {
        self.status.send_if_modified(|s| {
            let changed = s.ready_state != ReadyState::Ended;
            s.ready_state = ReadyState::Ended;
            changed
        });
    }
}

/// Capture provider that hands out [`SimulatedTrack`]s according to a script.
#[derive(Debug)]
pub struct SimulatedCapture {
    screen: Result<DisplaySurface, CaptureError>,
    microphone: Result<(), CaptureError>,
    issued: Mutex<Vec<Arc<SimulatedTrack>>>,
}

impl SimulatedCapture {
    /// Grants both requests; the screen capture reports `surface`.
    pub fn granting(surface: DisplaySurface) -> Self {
        Self {
            screen: Ok(surface),
            microphone: Ok(()),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn deny_screen(mut self, error: CaptureError) -> Self {
        self.screen = Err(error);
        self
    }

    pub fn deny_microphone(mut self, error: CaptureError) -> Self {
        self.microphone = Err(error);
        self
    }

    /// Every track handed out so far, in issue order.
    pub fn issued(&self) -> Vec<Arc<SimulatedTrack>> {
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn latest(&self, kind: TrackKind) -> Option<Arc<SimulatedTrack>> {
        self.issued().into_iter().rev().find(|t| t.kind == kind)
    }

    fn issue(&self, track: Arc<SimulatedTrack>) -> CaptureStream {
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&track));
        CaptureStream::new(vec![track as Arc<dyn MediaTrack>])
    }
}

#[async_trait]
impl CaptureProvider for SimulatedCapture {
    async fn request_screen(&self) -> Result<CaptureStream, CaptureError> {
        let surface = self.screen.clone()?;
        Ok(self.issue(SimulatedTrack::screen(surface)))
    }

    async fn request_microphone(&self) -> Result<CaptureStream, CaptureError> {
        self.microphone.clone()?;
        Ok(self.issue(SimulatedTrack::microphone()))
    }
}
