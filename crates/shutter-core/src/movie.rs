// crates/shutter-core/src/movie.rs
//
// Parameters that are fixed for the duration of one recording.
// Built once at movie start from the merged profile plus what the host
// reports about its render target and audio device; read-only afterwards.

use std::path::PathBuf;

use bytemuck::{Pod, Zeroable};

/// Planar output pixel formats the conversion table knows about.
///
/// NV12/NV21 carry an interleaved chroma plane; the YUV formats carry
/// separate U and V planes; BGR0 is a single packed plane with a zero
/// filler byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PixelFormat {
    Nv12,
    Nv21,
    Yuv420,
    Yuv422,
    Yuv444,
    Bgr0,
}

/// Colour matrix used by the YUV conversions. Ignored for BGR0.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ColorSpace {
    Bt601,
    Bt709,
}

/// A complete output format tag: pixel layout plus colour matrix.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VideoFormat {
    pub pixel: PixelFormat,
    pub space: ColorSpace,
}

impl VideoFormat {
    pub fn new(pixel: PixelFormat, space: ColorSpace) -> Self {
        Self { pixel, space }
    }
}

/// Audio contract reported by the host at movie start.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AudioParams {
    pub channels: u16,
    pub hz: u32,
    pub bits: u16,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self { channels: 2, hz: 44_100, bits: 16 }
    }
}

/// One interleaved stereo PCM sample pair.
///
/// Pod so sample runs can be handed around as raw bytes (WAV data chunk,
/// shared audio region) without per-sample marshalling.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Pod, Zeroable)]
pub struct WaveSample {
    pub l: i16,
    pub r: i16,
}

/// Everything a recording needs, resolved once at `start`.
#[derive(Clone, Debug)]
pub struct MovieParams {
    /// Output dimensions; must match the host's source texture.
    pub width: u32,
    pub height: u32,
    /// Output frame rate.
    pub fps: u32,
    /// Motion-sample multiplier. 1 means motion sampling is disabled.
    pub mosample_mult: u32,
    /// Exposure fraction in (0, 1].
    pub mosample_exposure: f64,
    pub format: VideoFormat,
    /// Encoder backend name, forwarded opaquely.
    pub encoder: String,
    pub x264_crf: u32,
    pub x264_preset: String,
    pub x264_intra: bool,
    pub dnxhr_profile: String,
    pub audio_enabled: bool,
    pub audio_encoder: String,
    pub audio: AudioParams,
    /// Final output path, extension already normalised.
    pub dest_file: PathBuf,
}

impl MovieParams {
    /// Host tick rate required to feed this movie: every output frame needs
    /// `mosample_mult` sub-frames when motion sampling is on.
    pub fn game_rate(&self) -> u32 {
        self.fps * self.mosample_mult.max(1)
    }
}
