//! Participant-side exam integrity: capture acquisition, violation detection
//! and the session state machine.

mod capture;
mod machine;
mod violation;

pub use capture::{
    CaptureError, CaptureProvider, CaptureStream, DisplaySurface, MediaTrack, ReadyState,
    SimulatedCapture, SimulatedTrack, TrackKind, TrackStatus,
};
pub use machine::{
    ComplianceEvent, ComplianceHandle, ComplianceInbox, ComplianceMachine, ComplianceSnapshot,
    ExamHost, ExamPhase, MIN_CHECK_PERIOD, RecordingHost, RecurringCheck, Severity,
};
pub use violation::{KeyStroke, Notice, PageEvent, TerminationCause, Violation};
