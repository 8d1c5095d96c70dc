//! The recording scheduler: the plan-builder algorithm and the owner task
//! that realizes the plan against the tuners and the capture graph.

pub mod plan;
pub mod recorder;

/// Identifies one capture session for the lifetime of the process.
pub type SessionId = u64;

pub use plan::{build_plan, RecordingCandidate, ScheduledRecording};
pub use recorder::{Recorder, RecorderError, RecorderHandle, SessionHandle, SessionKind};
