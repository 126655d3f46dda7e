// crates/shutter-core/src/events.rs
//
// Recording lifecycle events that flow from the capture engine back to the
// host over a channel. Plain data, no engine types.

use std::path::PathBuf;

use uuid::Uuid;

/// Sent by the pipeline driver as a recording progresses.
#[derive(Clone, Debug)]
pub enum CaptureEvent {
    /// A recording started and will write to `dest`.
    Started { id: Uuid, dest: PathBuf },
    /// Periodic progress: output frames delivered to the encoder so far.
    Progress { id: Uuid, frames: u64 },
    /// The recording died mid-flight (encoder crash, I/O failure). The
    /// pipeline is already torn down; subsequent frames are ignored.
    Failed { id: Uuid, reason: String },
    /// `end` completed and the output file is final.
    Finished { id: Uuid, frames: u64, dest: PathBuf },
}

impl CaptureEvent {
    pub fn id(&self) -> Uuid {
        match self {
            CaptureEvent::Started { id, .. }
            | CaptureEvent::Progress { id, .. }
            | CaptureEvent::Failed { id, .. }
            | CaptureEvent::Finished { id, .. } => *id,
        }
    }
}
