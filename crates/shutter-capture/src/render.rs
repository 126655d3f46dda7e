// crates/shutter-capture/src/render.rs
//
// The capability seam between the pipeline and the GPU.
//
// The pipeline only ever needs a handful of operations: create and destroy
// textures, run one of three fixed kernels, copy, map a staging texture and
// read it with whatever row pitch the driver reports, and hand a shared
// texture back and forth under a keyed mutex. Everything else (devices,
// views, command lists) stays behind the implementation.
//
// `soft` provides the complete CPU reference implementation the tests run
// against; a real device backend implements the same trait.

use std::sync::{Arc, Condvar, Mutex};

use anyhow::Result;
use shutter_core::movie::VideoFormat;

pub mod soft;

/// Texel layout of a texture.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TexFormat {
    /// One byte per texel (a single video plane).
    R8,
    /// Two bytes per texel (interleaved chroma plane).
    Rg8,
    /// Packed four-byte RGBA order.
    Rgba8,
    /// Packed four-byte BGRA order (host swapchain format).
    Bgra8,
    /// 32-bit float per channel; the motion-sample accumulator.
    Rgba32F,
}

impl TexFormat {
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TexFormat::R8 => 1,
            TexFormat::Rg8 => 2,
            TexFormat::Rgba8 | TexFormat::Bgra8 => 4,
            TexFormat::Rgba32F => 16,
        }
    }
}

/// Memory domain and bind purpose of a texture.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TexUsage {
    /// Device-local, kernel-visible.
    Default,
    /// Host-readable copy destination; the only usage that can be mapped.
    Staging,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TexFormat,
    pub usage: TexUsage,
}

/// Opaque backend texture id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TexHandle(pub(crate) u32);

impl TexHandle {
    /// The raw value, used where a texture crosses a process boundary
    /// (the shared-memory header stores it like an OS handle).
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// The fixed kernels the pipeline dispatches. Thread groups cover 8×8
/// texels each; callers pass `ceil(dim / 8)` groups per axis.
#[derive(Clone, Copy, Debug)]
pub enum Kernel {
    /// accumulator += weight × source, weight from `set_accum_weight`.
    /// One Rgba32F target.
    MosampleAccum,
    /// RGBA source → the planar video format across the bound plane
    /// targets, in plane order.
    Convert(VideoFormat),
    /// RGBA source (byte or float) packed into one Bgra8 target; used to
    /// resolve a finished composite into the shared hand-off texture.
    ResolveBgra,
}

/// Thread groups for one dimension: enough 8-wide groups to cover it.
pub fn dispatch_groups(dim: u32) -> u32 {
    dim.div_ceil(8)
}

/// A mapped staging texture. Rows are `row_pitch` bytes apart, which the
/// driver may pad beyond the tight width.
pub struct Mapped<'a> {
    pub data: &'a [u8],
    pub row_pitch: usize,
}

pub trait RenderBackend {
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TexHandle>;

    /// Create a texture that another device context (typically another
    /// process) can open, guarded by a keyed mutex. Created already
    /// released to `KEY_GAME`.
    fn create_shared_texture(&mut self, desc: &TextureDesc) -> Result<(TexHandle, KeyedMutex)>;

    fn destroy_texture(&mut self, tex: TexHandle);

    fn texture_desc(&self, tex: TexHandle) -> TextureDesc;

    /// Same dimensions and format; staging destinations allowed.
    fn copy_texture(&mut self, dest: TexHandle, source: TexHandle);

    fn clear(&mut self, tex: TexHandle, color: [f32; 4]);

    /// Upload the accumulation weight constant. Callers cache the last
    /// uploaded value and skip redundant uploads.
    fn set_accum_weight(&mut self, weight: f32);

    fn dispatch(
        &mut self,
        kernel: Kernel,
        source: TexHandle,
        targets: &[TexHandle],
        groups: (u32, u32),
    ) -> Result<()>;

    /// Map a staging texture for reading. Blocks until pending copies into
    /// it complete; fails only in ways fatal to the current recording.
    fn map_staging(&mut self, tex: TexHandle) -> Result<Mapped<'_>>;

    fn unmap_staging(&mut self, tex: TexHandle);
}

// ── Keyed mutex ───────────────────────────────────────────────────────────────

/// Key owned by the capture side (the writer).
pub const KEY_GAME: u64 = 1;
/// Key owned by the encoder side (the reader).
pub const KEY_ENCODER: u64 = 2;

struct KeyedMutexState {
    /// Which key the resource is currently released to; None while held.
    available_for: Option<u64>,
    acquires: u64,
    releases: u64,
}

/// Cross-context mutual exclusion for a shared texture, keyed by an
/// integer: `release(k)` hands the resource to whoever calls `acquire(k)`.
/// Cloned handles refer to the same underlying lock, so one clone can
/// cross to the encoder side.
#[derive(Clone)]
pub struct KeyedMutex {
    inner: Arc<(Mutex<KeyedMutexState>, Condvar)>,
}

impl KeyedMutex {
    /// A fresh lock, released to `initial_key`.
    pub fn new(initial_key: u64) -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(KeyedMutexState {
                    available_for: Some(initial_key),
                    acquires: 0,
                    releases: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Block until the resource is released to `key`, then hold it.
    pub fn acquire(&self, key: u64) {
        let (lock, cv) = &*self.inner;
        let mut st = lock.lock().unwrap();
        while st.available_for != Some(key) {
            st = cv.wait(st).unwrap();
        }
        st.available_for = None;
        st.acquires += 1;
    }

    /// Release the held resource to `key` and wake waiters.
    pub fn release(&self, key: u64) {
        let (lock, cv) = &*self.inner;
        let mut st = lock.lock().unwrap();
        assert!(st.available_for.is_none(), "release of a keyed mutex nobody holds");
        st.available_for = Some(key);
        st.releases += 1;
        drop(st);
        cv.notify_all();
    }

    /// (acquires, releases) so protocol tests can count pairs.
    pub fn pair_counts(&self) -> (u64, u64) {
        let st = self.inner.0.lock().unwrap();
        (st.acquires, st.releases)
    }
}
