// crates/shutter-capture/src/ipc.rs
//
// Capture ↔ encoder control plane for the two-process variant.
//
// One shared region holds a fixed header (pids, event word, movie params,
// the shared texture handle, an error slot) followed by the audio batch
// buffer. The capture side is the only command issuer: it writes the event
// word, wakes the encoder, and blocks until the encoder acks, watching the
// encoder process at the same time, so a crashed encoder turns into an
// error instead of a hang. The encoder never initiates anything; it only
// mutates the error slot.
//
// Video never crosses this memory: frames travel as a shared texture under
// a keyed mutex with strict turn-taking (write → release to the encoder →
// command → ack → reclaim). Audio crosses in batches: the host's packets
// are tiny, so samples pool in a pending ring and only a full batch (or
// the end-of-movie flush) is worth waking the encoder for.
//
// The OS specifics (mapping the region into both processes, the two
// auto-reset events, watching the process handle) sit behind `WakeChannel`;
// the launcher owns process creation and handle inheritance. `local_wake_
// pair` plus `EncoderStub` give an in-process encoder side for tests and
// embedded hosts.

use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Result};
use bytemuck::{Pod, Zeroable};
use shutter_core::movie::{MovieParams, WaveSample};

use crate::render::{
    dispatch_groups, Kernel, KeyedMutex, RenderBackend, TexFormat, TexHandle, TexUsage,
    TextureDesc, KEY_ENCODER, KEY_GAME,
};
use crate::render::soft::SharedTextureTable;
use crate::sink::EncoderSink;

/// Audio batch size: how many samples one NEW_AUDIO hand-off carries.
pub const ENCODER_MAX_SAMPLES: usize = 8192;

// ── Shared layout ─────────────────────────────────────────────────────────────

/// Movie parameters as they cross the process boundary. Fixed-size strings,
/// NUL-terminated; everything four-byte aligned so the block is Pod.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SharedMovieParams {
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub audio_channels: u32,
    pub audio_hz: u32,
    pub audio_bits: u32,
    pub x264_crf: u32,
    pub x264_intra: u32,
    pub use_audio: u32,
    pub dest_file: [u8; 260],
    pub video_encoder: [u8; 32],
    pub x264_preset: [u8; 32],
    pub dnxhr_profile: [u8; 32],
    pub audio_encoder: [u8; 32],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SharedMemHeader {
    pub game_pid: u32,
    /// Event handle values as seen by the encoder process; filled by the
    /// platform layer, zero for in-process channels.
    pub game_wake_event: u32,
    pub encoder_wake_event: u32,
    /// Pending `EncoderEvent` as a raw word; zero means none.
    pub event_type: u32,
    pub audio_buffer_offset: i32,
    pub waiting_audio_samples: i32,
    pub movie_params: SharedMovieParams,
    /// Shared texture handle for the encoder to open.
    pub game_texture: u32,
    /// Non-zero when the last command failed encoder-side.
    pub error: u32,
    pub error_message: [u8; 1024],
}

/// Total bytes of the shared region: header plus the audio batch buffer.
pub fn shared_region_size() -> usize {
    size_of::<SharedMemHeader>() + ENCODER_MAX_SAMPLES * size_of::<WaveSample>()
}

/// Copy `s` into a fixed NUL-terminated field, truncating if oversized.
pub fn pack_str(field: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
    field[n] = 0;
}

/// Read a NUL-terminated fixed field back.
pub fn read_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// ── Shared region ─────────────────────────────────────────────────────────────

struct RegionMem(std::cell::UnsafeCell<Box<[u32]>>);

// Both sides address the same memory; exclusivity comes from the command
// protocol, not the type system (see `with_bytes`).
unsafe impl Send for RegionMem {}
unsafe impl Sync for RegionMem {}

/// Handle to the shared memory block. Clones alias the same memory, which
/// is the point: one clone per side of the boundary.
#[derive(Clone)]
pub struct SharedRegion {
    mem: Arc<RegionMem>,
}

impl SharedRegion {
    /// Allocate an in-process region. Cross-process backing (a mapped
    /// file view) is the platform layer's business.
    pub fn alloc() -> Self {
        // u32 words keep the header aligned for the Pod casts.
        let words = shared_region_size().div_ceil(4);
        Self {
            mem: Arc::new(RegionMem(std::cell::UnsafeCell::new(
                vec![0u32; words].into_boxed_slice(),
            ))),
        }
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        // Safety: the wake-event round trip gives exactly one side access
        // at a time. The capture side only touches the region outside
        // `send` waits; the encoder side only between its wake and its
        // ack. That hand-off is the whole protocol.
        let words = unsafe { &mut *self.mem.0.get() };
        f(bytemuck::cast_slice_mut(words))
    }

    pub fn with_header<R>(&self, f: impl FnOnce(&mut SharedMemHeader) -> R) -> R {
        self.with_bytes(|bytes| {
            f(bytemuck::from_bytes_mut(&mut bytes[..size_of::<SharedMemHeader>()]))
        })
    }

    /// Copy a batch into the audio buffer region.
    pub fn write_audio(&self, samples: &[WaveSample]) {
        assert!(samples.len() <= ENCODER_MAX_SAMPLES);
        self.with_bytes(|bytes| {
            let at = size_of::<SharedMemHeader>();
            let dst = &mut bytes[at..at + samples.len() * size_of::<WaveSample>()];
            dst.copy_from_slice(bytemuck::cast_slice(samples));
        })
    }

    /// Read `count` samples back out of the audio buffer region.
    pub fn read_audio(&self, count: usize) -> Vec<WaveSample> {
        assert!(count <= ENCODER_MAX_SAMPLES);
        self.with_bytes(|bytes| {
            let at = size_of::<SharedMemHeader>();
            bytemuck::cast_slice(&bytes[at..at + count * size_of::<WaveSample>()]).to_vec()
        })
    }
}

// ── Events and wake channels ──────────────────────────────────────────────────

/// Commands the capture side issues. Zero is reserved for "none".
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EncoderEvent {
    Start = 1,
    NewVideo = 2,
    NewAudio = 3,
    Stop = 4,
}

impl EncoderEvent {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(EncoderEvent::Start),
            2 => Some(EncoderEvent::NewVideo),
            3 => Some(EncoderEvent::NewAudio),
            4 => Some(EncoderEvent::Stop),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WakeOutcome {
    /// The encoder processed the command and woke us.
    Acked,
    /// The encoder process went away instead.
    Exited,
}

/// Capture-side view of the wake pair: signal the encoder, then block on
/// "ack or encoder exit", the two-handle wait of the platform layer.
pub trait WakeChannel: Send + Sync {
    fn wake_encoder(&self);
    fn wait_game_wake(&self) -> WakeOutcome;
}

/// Encoder-side view: block for the next command, ack when done.
pub trait EncoderWake: Send {
    /// False when the capture side is gone and no command will come.
    fn wait_encoder_wake(&self) -> bool;
    fn wake_game(&self);
    /// Announce an (un)clean exit so the capture side stops waiting.
    fn mark_exited(&self);
}

#[derive(Default)]
struct WakeFlags {
    encoder_set: bool,
    game_set: bool,
    encoder_exited: bool,
    capture_gone: bool,
}

#[derive(Default)]
struct WakeHub {
    flags: Mutex<WakeFlags>,
    cv: Condvar,
}

pub struct GameSideWake {
    hub: Arc<WakeHub>,
}

pub struct EncoderSideWake {
    hub: Arc<WakeHub>,
}

/// In-process stand-in for the two auto-reset events plus process watch.
pub fn local_wake_pair() -> (GameSideWake, EncoderSideWake) {
    let hub = Arc::new(WakeHub::default());
    (GameSideWake { hub: Arc::clone(&hub) }, EncoderSideWake { hub })
}

impl WakeChannel for GameSideWake {
    fn wake_encoder(&self) {
        let mut flags = self.hub.flags.lock().unwrap();
        flags.encoder_set = true;
        drop(flags);
        self.hub.cv.notify_all();
    }

    fn wait_game_wake(&self) -> WakeOutcome {
        let mut flags = self.hub.flags.lock().unwrap();
        loop {
            if flags.game_set {
                flags.game_set = false; // auto-reset
                return WakeOutcome::Acked;
            }
            if flags.encoder_exited {
                return WakeOutcome::Exited;
            }
            flags = self.hub.cv.wait(flags).unwrap();
        }
    }
}

impl Drop for GameSideWake {
    fn drop(&mut self) {
        let mut flags = self.hub.flags.lock().unwrap();
        flags.capture_gone = true;
        drop(flags);
        self.hub.cv.notify_all();
    }
}

impl EncoderWake for EncoderSideWake {
    fn wait_encoder_wake(&self) -> bool {
        let mut flags = self.hub.flags.lock().unwrap();
        loop {
            if flags.encoder_set {
                flags.encoder_set = false; // auto-reset
                return true;
            }
            if flags.capture_gone {
                return false;
            }
            flags = self.hub.cv.wait(flags).unwrap();
        }
    }

    fn wake_game(&self) {
        let mut flags = self.hub.flags.lock().unwrap();
        flags.game_set = true;
        drop(flags);
        self.hub.cv.notify_all();
    }

    fn mark_exited(&self) {
        let mut flags = self.hub.flags.lock().unwrap();
        flags.encoder_exited = true;
        drop(flags);
        self.hub.cv.notify_all();
    }
}

// ── Capture-side link ─────────────────────────────────────────────────────────

/// The capture side's connection to the encoder process. Created once at
/// init (the encoder outlives individual recordings); cloned into each
/// recording's sink.
#[derive(Clone)]
pub struct EncoderLink {
    region: SharedRegion,
    wake: Arc<dyn WakeChannel>,
}

impl EncoderLink {
    pub fn new(region: SharedRegion, wake: Arc<dyn WakeChannel>) -> Self {
        region.with_header(|h| {
            h.game_pid = std::process::id();
            h.event_type = 0;
            h.audio_buffer_offset = size_of::<SharedMemHeader>() as i32;
            h.waiting_audio_samples = 0;
        });
        Self { region, wake }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Post one command and block until the encoder has handled it. The
    /// wait also watches the encoder process; a dead encoder or an error
    /// it reported both surface here.
    pub fn send(&self, event: EncoderEvent) -> Result<()> {
        self.region.with_header(|h| h.event_type = event as u32);
        self.wake.wake_encoder();

        match self.wake.wait_game_wake() {
            WakeOutcome::Exited => bail!("encoder exited or crashed"),
            WakeOutcome::Acked => {
                let error = self.region.with_header(|h| {
                    if h.error != 0 {
                        Some(read_str(&h.error_message))
                    } else {
                        None
                    }
                });
                match error {
                    Some(msg) => bail!("encoder: {msg}"),
                    None => Ok(()),
                }
            }
        }
    }
}

// ── Shared-texture sink ───────────────────────────────────────────────────────

pub struct SharedTexSink {
    link: EncoderLink,
    share_tex: TexHandle,
    lock: KeyedMutex,
    groups: (u32, u32),
    audio_enabled: bool,
    pending: VecDeque<WaveSample>,
}

impl std::fmt::Debug for SharedTexSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTexSink")
            .field("groups", &self.groups)
            .field("audio_enabled", &self.audio_enabled)
            .field("pending_len", &self.pending.len())
            .finish()
    }
}

impl SharedTexSink {
    /// Create the shared hand-off texture, publish the movie parameters,
    /// and send START. The sink starts as the texture owner.
    pub fn start(
        backend: &mut dyn RenderBackend,
        params: &MovieParams,
        link: EncoderLink,
    ) -> Result<Self> {
        let (share_tex, lock) = backend.create_shared_texture(&TextureDesc {
            width: params.width,
            height: params.height,
            format: TexFormat::Bgra8,
            usage: TexUsage::Default,
        })?;

        link.region().with_header(|h| {
            let p = &mut h.movie_params;
            p.video_width = params.width;
            p.video_height = params.height;
            p.video_fps = params.fps;
            p.audio_channels = params.audio.channels as u32;
            p.audio_hz = params.audio.hz;
            p.audio_bits = params.audio.bits as u32;
            p.x264_crf = params.x264_crf;
            p.x264_intra = params.x264_intra as u32;
            p.use_audio = params.audio_enabled as u32;
            pack_str(&mut p.dest_file, &params.dest_file.to_string_lossy());
            pack_str(&mut p.video_encoder, &params.encoder);
            pack_str(&mut p.x264_preset, &params.x264_preset);
            pack_str(&mut p.dnxhr_profile, &params.dnxhr_profile);
            pack_str(&mut p.audio_encoder, &params.audio_encoder);

            h.game_texture = share_tex.raw();
            h.waiting_audio_samples = 0;
            h.error = 0;
            h.error_message[0] = 0;
        });

        // Take initial ownership before the encoder can see the texture.
        lock.acquire(KEY_GAME);

        if let Err(e) = link.send(EncoderEvent::Start) {
            backend.destroy_texture(share_tex);
            return Err(e.context("encoder start"));
        }

        Ok(Self {
            link,
            share_tex,
            lock,
            groups: (dispatch_groups(params.width), dispatch_groups(params.height)),
            audio_enabled: params.audio_enabled,
            pending: VecDeque::with_capacity(ENCODER_MAX_SAMPLES * 2),
        })
    }

    fn send_audio_batch(&mut self, count: usize) -> Result<()> {
        let batch: Vec<WaveSample> = self.pending.drain(..count).collect();
        self.link.region().write_audio(&batch);
        self.link
            .region()
            .with_header(|h| h.waiting_audio_samples = count as i32);
        self.link.send(EncoderEvent::NewAudio)
    }

    /// Send any remaining samples just before the recording stops.
    fn flush_audio(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            let count = self.pending.len().min(ENCODER_MAX_SAMPLES);
            self.send_audio_batch(count)?;
        }
        Ok(())
    }
}

impl EncoderSink for SharedTexSink {
    fn begin_frame(&mut self) -> Result<()> {
        // The texture was reclaimed at the end of the previous frame;
        // nothing to reserve.
        Ok(())
    }

    fn push_frame(&mut self, backend: &mut dyn RenderBackend, frame: TexHandle) -> Result<()> {
        backend.dispatch(Kernel::ResolveBgra, frame, &[self.share_tex], self.groups)?;

        self.lock.release(KEY_ENCODER);
        match self.link.send(EncoderEvent::NewVideo) {
            Ok(()) => {
                self.lock.acquire(KEY_GAME); // reclaim for the next frame
                Ok(())
            }
            // A dead encoder never hands the mutex back; leave it
            // abandoned, teardown destroys the texture anyway.
            Err(e) => Err(e),
        }
    }

    fn push_audio(&mut self, samples: &[WaveSample]) -> Result<()> {
        if !self.audio_enabled {
            return Ok(());
        }
        // Motion-blur capture delivers packets of a dozen samples; waking
        // the encoder per packet would stall the game. Pool until a full
        // batch is ready.
        self.pending.extend(samples.iter().copied());
        while self.pending.len() >= ENCODER_MAX_SAMPLES {
            self.send_audio_batch(ENCODER_MAX_SAMPLES)?;
        }
        Ok(())
    }

    fn end(&mut self, backend: &mut dyn RenderBackend) -> Result<()> {
        let audio_result = if self.audio_enabled { self.flush_audio() } else { Ok(()) };
        let stop_result = self.link.send(EncoderEvent::Stop);
        backend.destroy_texture(self.share_tex);
        audio_result.and(stop_result)
    }
}

// ── In-process encoder side ───────────────────────────────────────────────────

/// Counters the stub exposes so tests can check the protocol from the
/// outside.
#[derive(Default)]
pub struct StubStats {
    pub starts: AtomicU32,
    pub frames: AtomicU32,
    pub audio_samples: AtomicU32,
    pub stops: AtomicU32,
}

#[derive(Default, Clone)]
pub struct StubConfig {
    /// Exit the encoder loop after this many accepted frames, without
    /// acking anything further: an encoder crash as the capture side
    /// sees it.
    pub crash_after_frames: Option<u32>,
    /// Report this error on START instead of succeeding.
    pub error_on_start: Option<String>,
}

/// In-process reference implementation of the encoder side of the
/// protocol: wait for a command, handle it, ack. Runs on its own thread
/// the way the real encoder runs in its own process.
pub struct EncoderStub {
    pub stats: Arc<StubStats>,
    thread: Option<JoinHandle<()>>,
}

impl EncoderStub {
    pub fn spawn(
        region: SharedRegion,
        wake: EncoderSideWake,
        textures: SharedTextureTable,
        config: StubConfig,
    ) -> Self {
        let stats = Arc::new(StubStats::default());
        let stats_out = Arc::clone(&stats);

        let thread = std::thread::Builder::new()
            .name("encoder-stub".into())
            .spawn(move || {
                let mut lock: Option<KeyedMutex> = None;

                while wake.wait_encoder_wake() {
                    let event = region.with_header(|h| h.event_type);
                    match EncoderEvent::from_u32(event) {
                        Some(EncoderEvent::Start) => {
                            if let Some(msg) = &config.error_on_start {
                                region.with_header(|h| {
                                    h.error = 1;
                                    pack_str(&mut h.error_message, msg);
                                });
                            } else {
                                let handle = region.with_header(|h| h.game_texture);
                                lock = textures.open(handle);
                                stats.starts.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Some(EncoderEvent::NewVideo) => {
                            if let Some(lock) = &lock {
                                lock.acquire(KEY_ENCODER);
                                stats.frames.fetch_add(1, Ordering::Relaxed);
                                lock.release(KEY_GAME);
                            }
                        }
                        Some(EncoderEvent::NewAudio) => {
                            let n = region.with_header(|h| h.waiting_audio_samples) as usize;
                            let samples = region.read_audio(n);
                            stats.audio_samples.fetch_add(samples.len() as u32, Ordering::Relaxed);
                        }
                        Some(EncoderEvent::Stop) => {
                            stats.stops.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {}
                    }

                    wake.wake_game();

                    if let Some(limit) = config.crash_after_frames {
                        if stats.frames.load(Ordering::Relaxed) >= limit {
                            break; // simulated crash
                        }
                    }
                }
                wake.mark_exited();
            })
            .expect("spawn encoder stub thread");

        Self { stats: stats_out, thread: Some(thread) }
    }

    /// Wait for the stub to exit (it does when every capture-side link is
    /// dropped, or when its crash trigger fires).
    pub fn join(mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
