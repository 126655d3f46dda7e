// crates/shutter-core/src/lib.rs
//
// Plain data and pure algorithms for the capture pipeline.
// No I/O, no threads, no GPU: everything here is unit-testable in isolation.

pub mod events;
pub mod mosample;
pub mod movie;
pub mod plan;
pub mod profile;
pub mod queue;

pub use events::CaptureEvent;
pub use mosample::MosampleTiming;
pub use movie::{AudioParams, ColorSpace, MovieParams, PixelFormat, VideoFormat, WaveSample};
pub use plan::ConversionPlan;
pub use profile::MovieProfile;
pub use queue::{AsyncStream, Semaphore};
