// crates/shutter-capture/src/pipeline.rs
//
// The pipeline driver: everything the host's hook layer calls.
//
// Lifecycle: `init` once (static state, logging, the encoder link in the
// two-process variant), then per movie `start` → `give_frame` /
// `give_audio` → `end`. A failure mid-recording never reaches the host's
// render loop: the recording is torn down, a Failed event goes out, and
// further `give_frame` calls are no-ops until the next `start`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use uuid::Uuid;

use shutter_core::events::CaptureEvent;
use shutter_core::movie::{AudioParams, MovieParams, WaveSample};
use shutter_core::profile::MovieProfile;

use crate::ipc::{EncoderLink, SharedTexSink};
use crate::logging;
use crate::mosample::MosampleStage;
use crate::overlay::{velo_pos, FrameOverlay, VeloState};
use crate::pipe::PipeEncoderSink;
use crate::render::{RenderBackend, TexHandle};
use crate::sink::EncoderSink;

/// Extensions the codec CLI can infer a container from. Anything else is
/// renamed to .mp4 before the recording starts.
const KNOWN_CONTAINERS: [&str; 3] = ["mp4", "mkv", "mov"];

/// How the engine reaches its encoder. Chosen once at `init`.
pub enum EncoderBinding {
    /// Spawn the external codec CLI per recording and stream raw frames
    /// over its stdin.
    Pipe,
    /// Hand frames to the long-lived encoder process over shared memory
    /// (the launcher created the link).
    Shared(EncoderLink),
    /// Host-supplied sink (embedding, tests).
    Custom(Box<dyn EncoderSinkFactory>),
}

/// Builds the sink for one recording in the `Custom` binding.
pub trait EncoderSinkFactory: Send {
    fn create(
        &mut self,
        backend: &mut dyn RenderBackend,
        params: &MovieParams,
    ) -> Result<Box<dyn EncoderSink>>;
}

struct ActiveMovie {
    id: Uuid,
    params: MovieParams,
    sink: Box<dyn EncoderSink>,
    mosample: Option<MosampleStage>,
    /// Sidecar text output for velocity, when the profile asks for it.
    velo_file: Option<BufWriter<File>>,
    frames_emitted: u64,
    /// Whole seconds of output already announced via Progress.
    progress_mark: u64,
}

pub struct CaptureState<B: RenderBackend> {
    resource_root: PathBuf,
    backend: B,
    binding: EncoderBinding,
    overlay: Option<Box<dyn FrameOverlay>>,
    velo: VeloState,
    /// Profile of the current (or most recent) movie; feature probes and
    /// the tick-rate query read this between recordings too.
    profile: MovieProfile,
    events_tx: Sender<CaptureEvent>,
    events_rx: Receiver<CaptureEvent>,
    active: Option<ActiveMovie>,
}

impl<B: RenderBackend> CaptureState<B> {
    /// Prepare static state. Must succeed before any movie can start.
    pub fn init(
        resource_root: &Path,
        backend: B,
        binding: EncoderBinding,
        overlay: Option<Box<dyn FrameOverlay>>,
    ) -> Result<Self> {
        logging::init(resource_root)?;
        log::info!("capture initialised, resources at {}", resource_root.display());

        let (events_tx, events_rx) = bounded(512);
        Ok(Self {
            resource_root: resource_root.to_path_buf(),
            backend,
            binding,
            overlay,
            velo: VeloState::default(),
            profile: MovieProfile::default(),
            events_tx,
            events_rx,
            active: None,
        })
    }

    /// Lifecycle events for the host to drain.
    pub fn events(&self) -> &Receiver<CaptureEvent> {
        &self.events_rx
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_velo_enabled(&self) -> bool {
        self.profile.velo_enabled
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.profile.audio_enabled
    }

    /// Tick rate the host must run at: sub-frame rate with motion
    /// sampling, output rate without.
    pub fn get_game_rate(&self) -> u32 {
        self.profile.video_fps * self.profile.effective_mult()
    }

    pub fn give_velocity(&mut self, xyz: [f32; 3]) {
        self.velo.set(xyz);
    }

    /// Begin a recording into `dest_file` using `profile_name` over the
    /// defaults. `source` is the host's render target; its dimensions
    /// become the movie dimensions.
    pub fn start(
        &mut self,
        dest_file: &str,
        profile_name: &str,
        source: TexHandle,
        audio: AudioParams,
    ) -> Result<()> {
        if self.active.is_some() {
            bail!("a recording is already running");
        }

        let profile = self.load_profile(profile_name)?;
        let desc = self.backend.texture_desc(source);
        let dest = self.resolve_dest(&profile, dest_file)?;

        let params = MovieParams {
            width: desc.width,
            height: desc.height,
            fps: profile.video_fps,
            mosample_mult: profile.effective_mult(),
            mosample_exposure: profile.mosample_exposure,
            format: profile.pixel_format(),
            encoder: profile.video_encoder.clone(),
            x264_crf: profile.video_x264_crf,
            x264_preset: profile.video_x264_preset.clone(),
            x264_intra: profile.video_x264_intra,
            dnxhr_profile: profile.video_dnxhr_profile.clone(),
            audio_enabled: profile.audio_enabled,
            audio_encoder: profile.audio_encoder.clone(),
            audio,
            dest_file: dest.clone(),
        };

        let velo_file = match (&profile.velo_enabled, &profile.velo_output) {
            (true, Some(path)) => Some(BufWriter::new(
                File::create(path)
                    .with_context(|| format!("create velocity output {}", path.display()))?,
            )),
            _ => None,
        };

        let mosample = if profile.mosample_enabled {
            Some(MosampleStage::start(&mut self.backend, &params)?)
        } else {
            None
        };

        let sink = match self.make_sink(&params) {
            Ok(sink) => sink,
            Err(e) => {
                if let Some(stage) = mosample {
                    stage.stop(&mut self.backend);
                }
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        log::info!(
            "movie {id} started: {} {}x{} @{}fps mult {} ({})",
            dest.display(),
            params.width,
            params.height,
            params.fps,
            params.mosample_mult,
            params.encoder,
        );
        let _ = self.events_tx.try_send(CaptureEvent::Started { id, dest: dest.clone() });

        self.profile = profile;
        self.active = Some(ActiveMovie {
            id,
            params,
            sink,
            mosample,
            velo_file,
            frames_emitted: 0,
            progress_mark: 0,
        });
        Ok(())
    }

    /// Offer one rendered host frame. With motion sampling the call rate
    /// must be `get_game_rate()`; output frames are emitted as windows
    /// complete. No-op when nothing is recording.
    pub fn give_frame(&mut self, source: TexHandle) {
        let Some(mut active) = self.active.take() else { return };

        let result = drive_frame(
            &mut self.backend,
            &mut active,
            &self.profile,
            &mut self.overlay,
            &self.velo,
            source,
        );

        match result {
            Ok(()) => {
                let fps = active.params.fps.max(1) as u64;
                if active.frames_emitted / fps > active.progress_mark {
                    active.progress_mark = active.frames_emitted / fps;
                    let _ = self.events_tx.try_send(CaptureEvent::Progress {
                        id: active.id,
                        frames: active.frames_emitted,
                    });
                }
                self.active = Some(active);
            }
            Err(e) => self.abort(active, e),
        }
    }

    /// Offer a block of PCM samples. No-op when nothing is recording.
    pub fn give_audio(&mut self, samples: &[WaveSample]) {
        let Some(mut active) = self.active.take() else { return };

        match active.sink.push_audio(samples) {
            Ok(()) => self.active = Some(active),
            Err(e) => self.abort(active, e),
        }
    }

    /// Stop and finalise the current recording. Flushes trailing audio,
    /// stops the encoder, and releases per-movie resources.
    pub fn end(&mut self) {
        let Some(mut active) = self.active.take() else { return };

        let result = active.sink.end(&mut self.backend);
        self.release_movie(&mut active);

        match result {
            Ok(()) => {
                log::info!(
                    "movie {} finished: {} frames to {}",
                    active.id,
                    active.frames_emitted,
                    active.params.dest_file.display()
                );
                let _ = self.events_tx.try_send(CaptureEvent::Finished {
                    id: active.id,
                    frames: active.frames_emitted,
                    dest: active.params.dest_file.clone(),
                });
            }
            Err(e) => {
                log::error!("movie {} failed while finishing: {e:#}", active.id);
                let _ = self.events_tx.try_send(CaptureEvent::Failed {
                    id: active.id,
                    reason: format!("{e:#}"),
                });
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Mid-recording failure: log it, tear the movie down, tell the host.
    /// The host keeps rendering; subsequent frames are no-ops.
    fn abort(&mut self, mut active: ActiveMovie, error: anyhow::Error) {
        log::error!("movie {} aborted: {error:#}", active.id);

        if let Err(e) = active.sink.end(&mut self.backend) {
            log::warn!("encoder teardown after failure: {e:#}");
        }
        self.release_movie(&mut active);

        let _ = self.events_tx.try_send(CaptureEvent::Failed {
            id: active.id,
            reason: format!("{error:#}"),
        });
    }

    fn release_movie(&mut self, active: &mut ActiveMovie) {
        if let Some(stage) = active.mosample.take() {
            stage.stop(&mut self.backend);
        }
        if let Some(mut f) = active.velo_file.take() {
            let _ = f.flush();
        }
    }

    fn make_sink(&mut self, params: &MovieParams) -> Result<Box<dyn EncoderSink>> {
        match &mut self.binding {
            EncoderBinding::Pipe => Ok(Box::new(PipeEncoderSink::start(
                &mut self.backend,
                params,
                &self.resource_root,
            )?)),
            EncoderBinding::Shared(link) => {
                let link = link.clone();
                Ok(Box::new(SharedTexSink::start(&mut self.backend, params, link)?))
            }
            EncoderBinding::Custom(factory) => factory.create(&mut self.backend, params),
        }
    }

    /// The default profile is the base; the named profile overlays it.
    /// A named profile that does not exist is a setup failure.
    fn load_profile(&self, name: &str) -> Result<MovieProfile> {
        let dir = self.resource_root.join("data").join("profiles");
        let mut profile = MovieProfile::default();

        let default_path = dir.join("default.ini");
        if default_path.exists() {
            apply_profile_file(&mut profile, &default_path)?;
        }

        let name = if name.is_empty() { "default" } else { name };
        if name != "default" {
            let path = dir.join(format!("{name}.ini"));
            apply_profile_file(&mut profile, &path)
                .with_context(|| format!("profile '{name}'"))?;
        }
        Ok(profile)
    }

    /// Output path rules: movies folder under the resource root (created
    /// on demand), or the profile's absolute override; unknown extensions
    /// become .mp4.
    fn resolve_dest(&self, profile: &MovieProfile, dest_file: &str) -> Result<PathBuf> {
        let dir = match &profile.video_output {
            Some(out) if out.is_absolute() => out.clone(),
            _ => self.resource_root.join("movies"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("create movie directory {}", dir.display()))?;

        let mut dest = dir.join(dest_file);
        let known = dest
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| KNOWN_CONTAINERS.iter().any(|k| e.eq_ignore_ascii_case(k)))
            .unwrap_or(false);
        if !known {
            log::warn!("unknown container for {dest_file}, renaming to .mp4");
            dest.set_extension("mp4");
        }
        Ok(dest)
    }
}

fn apply_profile_file(profile: &mut MovieProfile, path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read profile {}", path.display()))?;
    let unknown = profile
        .apply(&text)
        .with_context(|| format!("parse profile {}", path.display()))?;
    for key in unknown {
        log::warn!("profile {}: unknown option '{key}'", path.display());
    }
    Ok(())
}

/// Per-frame sequencing: motion sampling decides when composites finish;
/// without it every host frame is a finished composite.
fn drive_frame(
    backend: &mut dyn RenderBackend,
    active: &mut ActiveMovie,
    profile: &MovieProfile,
    overlay: &mut Option<Box<dyn FrameOverlay>>,
    velo: &VeloState,
    source: TexHandle,
) -> Result<()> {
    let ActiveMovie { params, sink, mosample, velo_file, frames_emitted, .. } = active;

    match mosample {
        Some(stage) => stage.step(backend, source, |b, finished| {
            finish_frame(b, sink.as_mut(), overlay, velo, profile, params, velo_file, frames_emitted, finished)
        }),
        None => finish_frame(
            backend,
            sink.as_mut(),
            overlay,
            velo,
            profile,
            params,
            velo_file,
            frames_emitted,
            source,
        ),
    }
}

/// One finished composite: compose the overlay (or append the velocity
/// line), then hand the frame to the encoder.
#[allow(clippy::too_many_arguments)]
fn finish_frame(
    backend: &mut dyn RenderBackend,
    sink: &mut dyn EncoderSink,
    overlay: &mut Option<Box<dyn FrameOverlay>>,
    velo: &VeloState,
    profile: &MovieProfile,
    params: &MovieParams,
    velo_file: &mut Option<BufWriter<File>>,
    frames_emitted: &mut u64,
    frame: TexHandle,
) -> Result<()> {
    if profile.velo_enabled {
        if let Some(file) = velo_file {
            let [x, y, z] = velo.xyz();
            writeln!(file, "{} {x:.2} {y:.2} {z:.2}", *frames_emitted)
                .context("write velocity line")?;
        } else if let Some(overlay) = overlay {
            let pos = velo_pos(profile, params.width, params.height);
            overlay.compose(backend, frame, &velo.speed_xy().to_string(), pos)?;
        }
    }

    sink.begin_frame()?;
    sink.push_frame(backend, frame)?;
    *frames_emitted += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::ipc::{local_wake_pair, EncoderStub, SharedRegion, StubConfig};
    use crate::readback::ReadbackPipeline;
    use crate::render::soft::SoftBackend;
    use crate::render::{TexFormat, TexUsage, TextureDesc};

    // ── Collecting sink ───────────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct Collected {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        audio: Arc<Mutex<Vec<WaveSample>>>,
    }

    struct CollectSink {
        readback: Option<ReadbackPipeline>,
        out: Collected,
    }

    impl EncoderSink for CollectSink {
        fn begin_frame(&mut self) -> Result<()> {
            Ok(())
        }

        fn push_frame(&mut self, backend: &mut dyn RenderBackend, frame: TexHandle) -> Result<()> {
            let readback = self.readback.as_mut().expect("sink ended");
            let mut buf = vec![0u8; readback.plan().total_size()];
            readback.convert_and_download(backend, frame, &mut buf)?;
            self.out.frames.lock().unwrap().push(buf);
            Ok(())
        }

        fn push_audio(&mut self, samples: &[WaveSample]) -> Result<()> {
            self.out.audio.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }

        fn end(&mut self, backend: &mut dyn RenderBackend) -> Result<()> {
            if let Some(rb) = self.readback.take() {
                rb.stop(backend);
            }
            Ok(())
        }
    }

    struct CollectFactory {
        out: Collected,
        last_params: Arc<Mutex<Option<MovieParams>>>,
    }

    impl EncoderSinkFactory for CollectFactory {
        fn create(
            &mut self,
            backend: &mut dyn RenderBackend,
            params: &MovieParams,
        ) -> Result<Box<dyn EncoderSink>> {
            *self.last_params.lock().unwrap() = Some(params.clone());
            Ok(Box::new(CollectSink {
                readback: Some(ReadbackPipeline::start(backend, params)?),
                out: self.out.clone(),
            }))
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Harness {
        state: CaptureState<SoftBackend>,
        out: Collected,
        last_params: Arc<Mutex<Option<MovieParams>>>,
        source: TexHandle,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = SoftBackend::new();
        let source = backend
            .create_texture(&TextureDesc {
                width: 16,
                height: 12,
                format: TexFormat::Bgra8,
                usage: TexUsage::Default,
            })
            .unwrap();

        let out = Collected::default();
        let last_params = Arc::new(Mutex::new(None));
        let factory = CollectFactory { out: out.clone(), last_params: Arc::clone(&last_params) };

        let state = CaptureState::init(
            dir.path(),
            backend,
            EncoderBinding::Custom(Box::new(factory)),
            None,
        )
        .unwrap();

        Harness { state, out, last_params, source, dir }
    }

    fn write_profile(dir: &Path, name: &str, text: &str) {
        let profiles = dir.join("data").join("profiles");
        fs::create_dir_all(&profiles).unwrap();
        fs::write(profiles.join(format!("{name}.ini")), text).unwrap();
    }

    fn frame_bytes(h: &Harness) -> Vec<Vec<u8>> {
        h.out.frames.lock().unwrap().clone()
    }

    // ── Scenarios ─────────────────────────────────────────────────────────────

    /// Passthrough: one output frame per host frame, colour preserved.
    #[test]
    fn passthrough_one_second() {
        let mut h = harness();
        write_profile(h.dir.path(), "pass", "video_encoder = libx264rgb\nvideo_fps = 60\n");

        h.state.backend_mut().clear(h.source, [0.5, 0.5, 0.5, 1.0]);
        h.state.start("a.mp4", "pass", h.source, AudioParams::default()).unwrap();
        for _ in 0..60 {
            h.state.give_frame(h.source);
        }
        h.state.end();

        let frames = frame_bytes(&h);
        assert_eq!(frames.len(), 60);
        // BGR0 output of constant grey: every colour byte is the same.
        for frame in &frames {
            for px in frame.chunks_exact(4) {
                assert_eq!(&px[..3], &[128, 128, 128]);
            }
        }

        match h.state.events().try_recv().unwrap() {
            CaptureEvent::Started { dest, .. } => {
                assert!(dest.ends_with(Path::new("movies/a.mp4")));
            }
            other => panic!("expected Started, got {other:?}"),
        }
    }

    /// Motion sampling at 16×: alternating black/white integrates to
    /// mid-grey, one output frame per 16 sub-frames.
    #[test]
    fn mosample_16x_alternating_is_mid_grey() {
        let mut h = harness();
        write_profile(
            h.dir.path(),
            "blur",
            "video_encoder = libx264rgb\nvideo_fps = 60\n\
             mosample_enabled = 1\nmosample_mult = 16\nmosample_exposure = 1.0\n",
        );

        h.state.start("blur.mp4", "blur", h.source, AudioParams::default()).unwrap();
        assert_eq!(h.state.get_game_rate(), 960);

        for i in 0..960 {
            let v = if i % 2 == 0 { 0.0 } else { 1.0 };
            h.state.backend_mut().clear(h.source, [v, v, v, 1.0]);
            h.state.give_frame(h.source);
        }
        h.state.end();

        let frames = frame_bytes(&h);
        assert_eq!(frames.len(), 60);
        for frame in &frames {
            for px in frame.chunks_exact(4) {
                // Mid-grey within one quantisation step.
                assert!(px[0] == 127 || px[0] == 128, "got {}", px[0]);
            }
        }
    }

    /// Half exposure still normalises: constant white stays full white.
    #[test]
    fn mosample_half_exposure_stays_white() {
        let mut h = harness();
        write_profile(
            h.dir.path(),
            "expo",
            "video_encoder = libx264rgb\nvideo_fps = 60\n\
             mosample_enabled = 1\nmosample_mult = 16\nmosample_exposure = 0.5\n",
        );

        h.state.backend_mut().clear(h.source, [1.0, 1.0, 1.0, 1.0]);
        h.state.start("white.mp4", "expo", h.source, AudioParams::default()).unwrap();
        for _ in 0..960 {
            h.state.give_frame(h.source);
        }
        h.state.end();

        let frames = frame_bytes(&h);
        assert_eq!(frames.len(), 60);
        for frame in &frames {
            for px in frame.chunks_exact(4) {
                assert_eq!(&px[..3], &[255, 255, 255]);
            }
        }
    }

    /// Audio offered in 12-sample packets arrives complete and in order.
    #[test]
    fn audio_passes_through_completely() {
        let mut h = harness();
        write_profile(h.dir.path(), "aud", "audio_enabled = 1\n");

        h.state.start("a.mkv", "aud", h.source, AudioParams::default()).unwrap();
        assert!(h.state.is_audio_enabled());

        let mut sent = 0i16;
        while (sent as usize) < 10_000 {
            let packet: Vec<WaveSample> =
                (0..12.min(10_000 - sent as usize))
                    .map(|i| WaveSample { l: sent + i as i16, r: 0 })
                    .collect();
            h.state.give_audio(&packet);
            sent += packet.len() as i16;
        }
        h.state.end();

        let audio = h.out.audio.lock().unwrap();
        assert_eq!(audio.len(), 10_000);
        assert_eq!(audio[0].l, 0);
        assert_eq!(audio[9_999].l, 9_999);
    }

    /// Encoder crash mid-recording: the failing frame reports, the
    /// recording stops, later frames are no-ops, the host survives.
    #[test]
    fn encoder_crash_stops_the_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = SoftBackend::new();
        let source = backend
            .create_texture(&TextureDesc {
                width: 16,
                height: 12,
                format: TexFormat::Bgra8,
                usage: TexUsage::Default,
            })
            .unwrap();

        let region = SharedRegion::alloc();
        let (game, encoder) = local_wake_pair();
        let stub = EncoderStub::spawn(
            region.clone(),
            encoder,
            backend.shared_textures(),
            StubConfig { crash_after_frames: Some(10), ..Default::default() },
        );
        let link = EncoderLink::new(region, Arc::new(game));

        let mut state = CaptureState::init(
            dir.path(),
            backend,
            EncoderBinding::Shared(link),
            None,
        )
        .unwrap();

        state.start("crash.mp4", "", source, AudioParams::default()).unwrap();
        for _ in 0..15 {
            state.give_frame(source);
        }
        assert!(!state.is_recording());

        // Drain events: a Started, maybe Progress, then exactly one Failed.
        let mut failed = 0;
        while let Ok(ev) = state.events().try_recv() {
            if let CaptureEvent::Failed { reason, .. } = ev {
                assert!(reason.contains("exited"), "reason: {reason}");
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
        assert_eq!(stub.stats.frames.load(std::sync::atomic::Ordering::Relaxed), 10);

        // `end` after the failure is a harmless no-op.
        state.end();

        drop(state);
        stub.join();
    }

    /// A failed staging map is fatal to the recording, never to the host.
    #[test]
    fn map_failure_aborts_the_recording() {
        let mut h = harness();
        write_profile(h.dir.path(), "pass", "video_encoder = libx264rgb\n");

        h.state.start("a.mp4", "pass", h.source, AudioParams::default()).unwrap();
        h.state.backend_mut().inject_map_failure();
        h.state.give_frame(h.source);
        assert!(!h.state.is_recording());
        let failed = std::iter::from_fn(|| h.state.events().try_recv().ok())
            .any(|ev| matches!(ev, CaptureEvent::Failed { .. }));
        assert!(failed);
    }

    /// With the velocity HUD on and no sidecar output, the host's overlay
    /// composes onto every finished frame before hand-off.
    #[test]
    fn overlay_composes_before_hand_off() {
        struct RecordingOverlay {
            calls: Arc<Mutex<Vec<(String, (i32, i32))>>>,
        }
        impl FrameOverlay for RecordingOverlay {
            fn compose(
                &mut self,
                _backend: &mut dyn RenderBackend,
                _target: TexHandle,
                text: &str,
                pos: (i32, i32),
            ) -> Result<()> {
                self.calls.lock().unwrap().push((text.to_string(), pos));
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut backend = SoftBackend::new();
        let source = backend
            .create_texture(&TextureDesc {
                width: 16,
                height: 12,
                format: TexFormat::Bgra8,
                usage: TexUsage::Default,
            })
            .unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let out = Collected::default();
        let factory = CollectFactory {
            out: out.clone(),
            last_params: Arc::new(Mutex::new(None)),
        };

        let mut state = CaptureState::init(
            dir.path(),
            backend,
            EncoderBinding::Custom(Box::new(factory)),
            Some(Box::new(RecordingOverlay { calls: Arc::clone(&calls) })),
        )
        .unwrap();
        write_profile(dir.path(), "hud", "video_encoder = libx264rgb\nvelo_enabled = 1\n");

        state.start("a.mp4", "hud", source, AudioParams::default()).unwrap();
        state.give_velocity([3.0, 4.0, 0.0]);
        state.give_frame(source);
        state.end();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "5");
        // Default alignment sits below centre.
        assert_eq!(calls[0].1 .0, 8);
        assert_eq!(out.frames.lock().unwrap().len(), 1);
    }

    // ── Smaller contracts ─────────────────────────────────────────────────────

    #[test]
    fn unknown_extension_is_renamed_to_mp4() {
        let mut h = harness();
        write_profile(h.dir.path(), "pass", "video_encoder = libx264rgb\n");

        h.state.start("clip.xyz", "pass", h.source, AudioParams::default()).unwrap();
        h.state.end();

        let params = h.last_params.lock().unwrap().clone().unwrap();
        assert!(params.dest_file.ends_with(Path::new("movies/clip.mp4")));
    }

    #[test]
    fn missing_named_profile_fails_start() {
        let mut h = harness();
        let err = h
            .state
            .start("a.mp4", "nonexistent", h.source, AudioParams::default())
            .unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
        assert!(!h.state.is_recording());
    }

    #[test]
    fn default_profile_file_is_the_base_layer() {
        let mut h = harness();
        write_profile(h.dir.path(), "default", "video_fps = 30\naudio_enabled = 1\n");
        write_profile(h.dir.path(), "override", "video_fps = 120\n");

        h.state.start("a.mp4", "override", h.source, AudioParams::default()).unwrap();
        // The named profile overrides fps; audio comes from the default.
        assert_eq!(h.state.get_game_rate(), 120);
        assert!(h.state.is_audio_enabled());
        h.state.end();
    }

    #[test]
    fn velocity_sidecar_lines_are_written() {
        let mut h = harness();
        let velo_path = h.dir.path().join("velo.txt");
        write_profile(
            h.dir.path(),
            "velo",
            &format!(
                "video_encoder = libx264rgb\nvelo_enabled = 1\nvelo_output = {}\n",
                velo_path.display()
            ),
        );

        h.state.start("a.mp4", "velo", h.source, AudioParams::default()).unwrap();
        assert!(h.state.is_velo_enabled());
        h.state.give_velocity([3.0, 4.0, 0.0]);
        h.state.give_frame(h.source);
        h.state.give_frame(h.source);
        h.state.end();

        let text = fs::read_to_string(&velo_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0 3.00 4.00 0.00");
        assert_eq!(lines[1], "1 3.00 4.00 0.00");
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut h = harness();
        write_profile(h.dir.path(), "pass", "video_encoder = libx264rgb\n");

        h.state.start("a.mp4", "pass", h.source, AudioParams::default()).unwrap();
        assert!(h.state.start("b.mp4", "pass", h.source, AudioParams::default()).is_err());
        h.state.end();
    }

    #[test]
    fn frames_and_audio_without_a_recording_are_no_ops() {
        let mut h = harness();
        h.state.give_frame(h.source);
        h.state.give_audio(&[WaveSample { l: 1, r: 1 }]);
        assert!(frame_bytes(&h).is_empty());
    }
}
