use std::fmt;

use super::capture::{CaptureError, DisplaySurface, TrackKind};

/// A detected rule breach during an active exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    // Compulsory: terminate immediately.
    TrackEnded(TrackKind),
    TrackDisabled(TrackKind),
    ScreenNotLive,
    MicrophoneNotLive,
    SurfaceChanged(DisplaySurface),
    SignalingLost,

    // Warning: counted towards the cap.
    TabHidden,
    WindowBlur,
    FullscreenExit,
    ContextMenu,
    DevToolsShortcut,
    PrintScreen,
}

impl Violation {
    pub fn is_compulsory(&self) -> bool {
        matches!(
            self,
            Violation::TrackEnded(_)
                | Violation::TrackDisabled(_)
                | Violation::ScreenNotLive
                | Violation::MicrophoneNotLive
                | Violation::SurfaceChanged(_)
                | Violation::SignalingLost
        )
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::TrackEnded(kind) => write!(f, "{} was stopped", kind.label()),
            Violation::TrackDisabled(kind) => write!(f, "{} was disabled", kind.label()),
            Violation::ScreenNotLive => f.write_str("Screen sharing was interrupted"),
            Violation::MicrophoneNotLive => f.write_str("Microphone access was interrupted"),
            Violation::SurfaceChanged(surface) => {
                write!(f, "Switched from entire screen sharing (now sharing: {})", surface)
            }
            Violation::SignalingLost => f.write_str("Lost connection to server"),
            Violation::TabHidden => f.write_str("Tab switch detected"),
            Violation::WindowBlur => f.write_str("Window switch detected"),
            Violation::FullscreenExit => f.write_str("Fullscreen exited"),
            Violation::ContextMenu => f.write_str("Right-click is disabled during the exam"),
            Violation::DevToolsShortcut => f.write_str("Attempt to open developer tools"),
            Violation::PrintScreen => f.write_str("Screenshots are disabled during the exam"),
        }
    }
}

/// A key press as reported by the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStroke {
    pub key: String,
    pub ctrl: bool,
    pub shift: bool,
}

impl KeyStroke {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: false,
            shift: false,
        }
    }

    pub fn with_ctrl_shift(mut self) -> Self {
        self.ctrl = true;
        self.shift = true;
        self
    }

    /// Blocked shortcuts: F12, Ctrl+Shift+I/J/C and PrintScreen.
    pub fn classify(&self) -> Option<Violation> {
        match self.key.as_str() {
            "F12" => Some(Violation::DevToolsShortcut),
            "PrintScreen" => Some(Violation::PrintScreen),
            key if self.ctrl && self.shift && ["I", "J", "C"].iter().any(|k| k.eq_ignore_ascii_case(key)) => {
                Some(Violation::DevToolsShortcut)
            }
            _ => None,
        }
    }
}

/// Raw observations fed to the compliance machine by the page/platform glue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    VisibilityChanged { hidden: bool },
    WindowBlurred { document_hidden: bool },
    FullscreenChanged { active: bool },
    ContextMenu,
    KeyDown(KeyStroke),
    TrackEnded(TrackKind),
    TrackDisabled(TrackKind),
}

impl PageEvent {
    pub fn classify(&self) -> Option<Violation> {
        match self {
            PageEvent::VisibilityChanged { hidden: true } => Some(Violation::TabHidden),
            PageEvent::VisibilityChanged { hidden: false } => None,
            // A blur caused by hiding the tab is already counted as TabHidden.
            PageEvent::WindowBlurred { document_hidden } => {
                (!document_hidden).then_some(Violation::WindowBlur)
            }
            PageEvent::FullscreenChanged { active } => (!active).then_some(Violation::FullscreenExit),
            PageEvent::ContextMenu => Some(Violation::ContextMenu),
            PageEvent::KeyDown(stroke) => stroke.classify(),
            PageEvent::TrackEnded(kind) => Some(Violation::TrackEnded(*kind)),
            PageEvent::TrackDisabled(kind) => Some(Violation::TrackDisabled(*kind)),
        }
    }
}

/// Why an exam session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    Compulsory(Violation),
    WarningLimit(Violation),
    EndedByParticipant,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Compulsory(v) => {
                write!(f, "{}. This is a compulsory requirement violation.", v)
            }
            TerminationCause::WarningLimit(v) => {
                write!(f, "Maximum warnings reached (last: {}).", v)
            }
            TerminationCause::EndedByParticipant => f.write_str("Exam ended."),
        }
    }
}

/// User-visible message that must be acknowledged before the machine moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    NameRequired,
    ScreenUnavailable(CaptureError),
    WrongSurface(DisplaySurface),
    MicrophoneUnavailable(CaptureError),
    Warning {
        violation: Violation,
        count: u32,
        max: u32,
    },
    Terminated(TerminationCause),
}

impl Notice {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Notice::Warning { .. } | Notice::NameRequired)
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::NameRequired => f.write_str("Please enter your name"),
            Notice::ScreenUnavailable(CaptureError::PermissionDenied) => f.write_str(
                "PERMISSION DENIED: entire screen sharing and microphone access are both compulsory",
            ),
            Notice::ScreenUnavailable(CaptureError::NoDevice) => {
                f.write_str("DEVICE NOT FOUND: a screen to share is required to take the exam")
            }
            Notice::ScreenUnavailable(e) => write!(f, "EXAM CANNOT START: {}", e),
            Notice::WrongSurface(surface) => write!(
                f,
                "EXAM CANNOT START: you must share your ENTIRE SCREEN (you selected: {})",
                surface
            ),
            Notice::MicrophoneUnavailable(CaptureError::NoDevice) => {
                f.write_str("DEVICE NOT FOUND: a working microphone is required to take the exam")
            }
            Notice::MicrophoneUnavailable(_) => {
                f.write_str("EXAM CANNOT START: microphone access is compulsory and was not granted")
            }
            Notice::Warning {
                violation,
                count,
                max,
            } => write!(f, "WARNING {}/{}: {}", count, max, violation),
            Notice::Terminated(cause) => write!(f, "EXAM TERMINATED: {}", cause),
        }
    }
}
