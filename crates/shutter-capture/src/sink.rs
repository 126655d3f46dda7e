// crates/shutter-capture/src/sink.rs
//
// The seam between the pipeline driver and whatever consumes finished
// frames. Two shipped implementations: `pipe::PipeEncoderSink` streams raw
// frames into an external codec CLI, `ipc::SharedTexSink` hands a shared
// texture to the long-lived encoder process. The driver never knows which
// one it is talking to.

use anyhow::Result;
use shutter_core::movie::WaveSample;

use crate::render::{RenderBackend, TexHandle};

pub trait EncoderSink: Send {
    /// Reserve whatever the next frame needs (a free send buffer, the
    /// shared texture). May block while the encoder catches up.
    fn begin_frame(&mut self) -> Result<()>;

    /// Hand one finished composite over. `frame` is borrowed for the call
    /// only; the sink must not retain it.
    fn push_frame(&mut self, backend: &mut dyn RenderBackend, frame: TexHandle) -> Result<()>;

    /// Offer a PCM run. Sinks batch internally; delivery order is the call
    /// order.
    fn push_audio(&mut self, samples: &[WaveSample]) -> Result<()>;

    /// Flush trailing audio and video, stop the encoder, release
    /// everything. The sink is unusable afterwards.
    fn end(&mut self, backend: &mut dyn RenderBackend) -> Result<()>;
}
