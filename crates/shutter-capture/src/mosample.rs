// crates/shutter-capture/src/mosample.rs
//
// Device side of motion sampling: owns the high-precision work texture and
// turns the timing decisions into accumulate dispatches and emitted
// composites.
//
// The weight constant is cached host-side; consecutive sub-frames with the
// same weight (the common case mid-window) skip the upload.

use anyhow::Result;
use shutter_core::mosample::MosampleTiming;
use shutter_core::movie::MovieParams;

use crate::render::{dispatch_groups, Kernel, RenderBackend, TexFormat, TexHandle, TexUsage, TextureDesc};

/// Accumulator reset colour: black, opaque.
const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

pub struct MosampleStage {
    timing: MosampleTiming,
    work_tex: TexHandle,
    weight_cache: f32,
    groups: (u32, u32),
}

impl MosampleStage {
    pub fn start(backend: &mut dyn RenderBackend, params: &MovieParams) -> Result<Self> {
        let work_tex = backend.create_texture(&TextureDesc {
            width: params.width,
            height: params.height,
            format: TexFormat::Rgba32F,
            usage: TexUsage::Default,
        })?;
        backend.clear(work_tex, CLEAR_COLOR);

        Ok(Self {
            timing: MosampleTiming::new(params.mosample_mult, params.mosample_exposure),
            work_tex,
            weight_cache: 0.0,
            groups: (dispatch_groups(params.width), dispatch_groups(params.height)),
        })
    }

    /// Feed one sub-frame. `emit` is called once per finished composite
    /// with the work texture holding it.
    pub fn step<B, F>(&mut self, backend: &mut B, source: TexHandle, mut emit: F) -> Result<()>
    where
        B: RenderBackend + ?Sized,
        F: FnMut(&mut B, TexHandle) -> Result<()>,
    {
        let out = self.timing.advance();

        if let Some(weight) = out.accumulate {
            self.accumulate(backend, source, weight as f32)?;
        }
        for _ in 0..out.emits {
            emit(backend, self.work_tex)?;
        }
        if out.clear {
            backend.clear(self.work_tex, CLEAR_COLOR);
        }
        if let Some(weight) = out.carry {
            self.accumulate(backend, source, weight as f32)?;
        }
        Ok(())
    }

    fn accumulate<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        source: TexHandle,
        weight: f32,
    ) -> Result<()> {
        if weight != self.weight_cache {
            backend.set_accum_weight(weight);
            self.weight_cache = weight;
        }
        backend.dispatch(Kernel::MosampleAccum, source, &[self.work_tex], self.groups)
    }

    pub fn stop(self, backend: &mut dyn RenderBackend) {
        backend.destroy_texture(self.work_tex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::soft::SoftBackend;
    use shutter_core::movie::{AudioParams, ColorSpace, PixelFormat, VideoFormat};

    fn params(mult: u32, exposure: f64, w: u32, h: u32) -> MovieParams {
        MovieParams {
            width: w,
            height: h,
            fps: 60,
            mosample_mult: mult,
            mosample_exposure: exposure,
            format: VideoFormat::new(PixelFormat::Bgr0, ColorSpace::Bt601),
            encoder: "libx264rgb".into(),
            x264_crf: 18,
            x264_preset: "veryfast".into(),
            x264_intra: false,
            dnxhr_profile: String::new(),
            audio_enabled: false,
            audio_encoder: String::new(),
            audio: AudioParams::default(),
            dest_file: "out.mp4".into(),
        }
    }

    fn source(be: &mut SoftBackend, w: u32, h: u32) -> TexHandle {
        be.create_texture(&TextureDesc {
            width: w,
            height: h,
            format: TexFormat::Bgra8,
            usage: TexUsage::Default,
        })
        .unwrap()
    }

    #[test]
    fn constant_source_integrates_to_itself() {
        let mut be = SoftBackend::new();
        let src = source(&mut be, 8, 8);
        be.clear(src, [0.6, 0.6, 0.6, 1.0]);

        let mut stage = MosampleStage::start(&mut be, &params(16, 1.0, 8, 8)).unwrap();
        let mut emitted = Vec::new();
        for _ in 0..16 {
            stage
                .step(&mut be, src, |b, work| {
                    emitted.push(b.read_rgba(work, 4, 4));
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(emitted.len(), 1);
        // 16 × (1/16 × 0.6) with one byte quantisation on the source read.
        let grey = (0.6f32 * 255.0).round() / 255.0;
        assert!((emitted[0][0] - grey).abs() < 1e-4, "got {}", emitted[0][0]);
        stage.stop(&mut be);
    }

    #[test]
    fn alternating_black_white_averages_to_half() {
        let mut be = SoftBackend::new();
        let src = source(&mut be, 8, 8);

        let mut stage = MosampleStage::start(&mut be, &params(16, 1.0, 8, 8)).unwrap();
        let mut emitted = Vec::new();
        for i in 0..32 {
            let v = if i % 2 == 0 { 0.0 } else { 1.0 };
            be.clear(src, [v, v, v, 1.0]);
            stage
                .step(&mut be, src, |b, work| {
                    emitted.push(b.read_rgba(work, 4, 4));
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(emitted.len(), 2);
        for frame in &emitted {
            assert!((frame[0] - 0.5).abs() < 1e-5, "got {}", frame[0]);
        }
        stage.stop(&mut be);
    }

    #[test]
    fn partial_exposure_still_normalises() {
        let mut be = SoftBackend::new();
        let src = source(&mut be, 8, 8);
        be.clear(src, [1.0, 1.0, 1.0, 1.0]);

        let mut stage = MosampleStage::start(&mut be, &params(16, 0.5, 8, 8)).unwrap();
        let mut emitted = Vec::new();
        for _ in 0..16 {
            stage
                .step(&mut be, src, |b, work| {
                    emitted.push(b.read_rgba(work, 4, 4));
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(emitted.len(), 1);
        assert!((emitted[0][0] - 1.0).abs() < 1e-5, "got {}", emitted[0][0]);
        stage.stop(&mut be);
    }

    #[test]
    fn emit_failure_propagates() {
        let mut be = SoftBackend::new();
        let src = source(&mut be, 8, 8);
        let mut stage = MosampleStage::start(&mut be, &params(1, 1.0, 8, 8)).unwrap();
        let res = stage.step(&mut be, src, |_, _| anyhow::bail!("sink died"));
        assert!(res.is_err());
        stage.stop(&mut be);
    }
}
