// crates/shutter-capture/src/render/soft.rs
//
// CPU reference implementation of the render backend.
//
// Every kernel the pipeline dispatches is executed in plain code over
// heap-backed texel storage. Staging maps report a padded row pitch the way
// real drivers do (pitch rounded up, here to 32 bytes) so the readback
// path's stride handling is exercised, and the backend tracks outstanding
// maps per texture: mapping a texture twice, or copying into a mapped
// one, is a hard failure instead of silent corruption.
//
// Colour conversion decisions (recorded in DESIGN.md): YUV output is
// limited-range with the matrix derived from (kr, kb); chroma for
// subsampled planes averages the covered source block.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use shutter_core::movie::{ColorSpace, PixelFormat, VideoFormat};
use shutter_core::plan::ConversionPlan;

use super::{Kernel, KeyedMutex, Mapped, RenderBackend, TexFormat, TexHandle, TexUsage, TextureDesc, KEY_GAME};

/// Synthetic driver row alignment for staging maps, in bytes.
const STAGING_PITCH_ALIGN: usize = 32;

enum TexData {
    Bytes(Vec<u8>),
    Floats(Vec<f32>), // RGBA quadruplets
}

struct SoftTex {
    desc: TextureDesc,
    data: TexData,
    /// Bytes between row starts (padded for staging textures).
    row_pitch: usize,
    mapped: bool,
}

impl SoftTex {
    fn new(desc: TextureDesc) -> Self {
        let w = desc.width as usize;
        let h = desc.height as usize;
        let tight = w * desc.format.bytes_per_texel();

        let (data, row_pitch) = match (desc.format, desc.usage) {
            (TexFormat::Rgba32F, TexUsage::Default) => {
                (TexData::Floats(vec![0.0; w * h * 4]), tight)
            }
            (_, TexUsage::Staging) => {
                let pitch = tight.div_ceil(STAGING_PITCH_ALIGN) * STAGING_PITCH_ALIGN;
                (TexData::Bytes(vec![0; pitch * h]), pitch)
            }
            _ => (TexData::Bytes(vec![0; tight * h]), tight),
        };

        Self { desc, data, row_pitch, mapped: false }
    }

    fn bytes(&self) -> &[u8] {
        match &self.data {
            TexData::Bytes(b) => b,
            TexData::Floats(_) => panic!("byte access to a float texture"),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            TexData::Bytes(b) => b,
            TexData::Floats(_) => panic!("byte access to a float texture"),
        }
    }

    /// Read one texel as normalised RGBA.
    fn texel_rgba(&self, x: usize, y: usize) -> [f32; 4] {
        let w = self.desc.width as usize;
        match &self.data {
            TexData::Floats(f) => {
                let i = (y * w + x) * 4;
                [f[i], f[i + 1], f[i + 2], f[i + 3]]
            }
            TexData::Bytes(b) => {
                let i = y * self.row_pitch + x * self.desc.format.bytes_per_texel();
                match self.desc.format {
                    TexFormat::Rgba8 => [
                        b[i] as f32 / 255.0,
                        b[i + 1] as f32 / 255.0,
                        b[i + 2] as f32 / 255.0,
                        b[i + 3] as f32 / 255.0,
                    ],
                    TexFormat::Bgra8 => [
                        b[i + 2] as f32 / 255.0,
                        b[i + 1] as f32 / 255.0,
                        b[i] as f32 / 255.0,
                        b[i + 3] as f32 / 255.0,
                    ],
                    _ => panic!("RGBA read from a plane texture"),
                }
            }
        }
    }
}

/// Registry standing in for OS shared-resource handles: the capture side
/// publishes a shared texture's lock under its raw handle value and the
/// encoder side opens it by that value.
#[derive(Clone, Default)]
pub struct SharedTextureTable {
    locks: Arc<Mutex<HashMap<u32, KeyedMutex>>>,
}

impl SharedTextureTable {
    pub fn open(&self, handle: u32) -> Option<KeyedMutex> {
        self.locks.lock().unwrap().get(&handle).cloned()
    }

    fn publish(&self, handle: u32, lock: KeyedMutex) {
        self.locks.lock().unwrap().insert(handle, lock);
    }
}

#[derive(Default)]
pub struct SoftBackend {
    textures: Vec<Option<SoftTex>>,
    accum_weight: f32,
    shared: SharedTextureTable,
    fail_next_map: bool,
}

impl SoftBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle registry shared textures are published into; clone it across
    /// to whatever plays the encoder side.
    pub fn shared_textures(&self) -> SharedTextureTable {
        self.shared.clone()
    }

    /// Make the next `map_staging` fail, as a lost device would.
    pub fn inject_map_failure(&mut self) {
        self.fail_next_map = true;
    }

    /// Upload full-resolution RGBA content into a texture (test harness for
    /// "the host rendered a frame").
    pub fn write_rgba(&mut self, tex: TexHandle, pixels: &[[f32; 4]]) {
        let t = self.tex_mut(tex);
        let w = t.desc.width as usize;
        let h = t.desc.height as usize;
        assert_eq!(pixels.len(), w * h);

        match &mut t.data {
            TexData::Floats(f) => {
                for (i, px) in pixels.iter().enumerate() {
                    f[i * 4..i * 4 + 4].copy_from_slice(px);
                }
            }
            TexData::Bytes(_) => {
                let format = t.desc.format;
                let pitch = t.row_pitch;
                let bytes = t.bytes_mut();
                for y in 0..h {
                    for x in 0..w {
                        let px = pixels[y * w + x];
                        let i = y * pitch + x * format.bytes_per_texel();
                        let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                        match format {
                            TexFormat::Rgba8 => {
                                bytes[i] = q(px[0]);
                                bytes[i + 1] = q(px[1]);
                                bytes[i + 2] = q(px[2]);
                                bytes[i + 3] = q(px[3]);
                            }
                            TexFormat::Bgra8 => {
                                bytes[i] = q(px[2]);
                                bytes[i + 1] = q(px[1]);
                                bytes[i + 2] = q(px[0]);
                                bytes[i + 3] = q(px[3]);
                            }
                            _ => panic!("RGBA upload into a plane texture"),
                        }
                    }
                }
            }
        }
    }

    /// Read one texel as normalised RGBA (test harness).
    pub fn read_rgba(&self, tex: TexHandle, x: u32, y: u32) -> [f32; 4] {
        self.tex(tex).texel_rgba(x as usize, y as usize)
    }

    pub fn is_mapped(&self, tex: TexHandle) -> bool {
        self.tex(tex).mapped
    }

    fn tex(&self, handle: TexHandle) -> &SoftTex {
        self.textures[handle.0 as usize].as_ref().expect("destroyed texture")
    }

    fn tex_mut(&mut self, handle: TexHandle) -> &mut SoftTex {
        self.textures[handle.0 as usize].as_mut().expect("destroyed texture")
    }

    fn two_tex_mut(&mut self, a: TexHandle, b: TexHandle) -> (&mut SoftTex, &mut SoftTex) {
        assert_ne!(a.0, b.0);
        let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        let (head, tail) = self.textures.split_at_mut(hi as usize);
        let lo_tex = head[lo as usize].as_mut().expect("destroyed texture");
        let hi_tex = tail[0].as_mut().expect("destroyed texture");
        if a.0 < b.0 {
            (lo_tex, hi_tex)
        } else {
            (hi_tex, lo_tex)
        }
    }

    fn run_convert(
        &mut self,
        format: VideoFormat,
        source: TexHandle,
        targets: &[TexHandle],
        groups: (u32, u32),
    ) -> Result<()> {
        let src_desc = self.tex(source).desc;
        let plan = ConversionPlan::new(format, src_desc.width, src_desc.height);
        if targets.len() != plan.plane_count() {
            bail!("convert kernel bound {} targets, plan has {} planes", targets.len(), plan.plane_count());
        }

        // Thread groups clip the processed source area; an under-dispatch
        // leaves texels untouched exactly like real hardware would.
        let cover_w = (groups.0 as usize * 8).min(src_desc.width as usize);
        let cover_h = (groups.1 as usize * 8).min(src_desc.height as usize);

        let (kr, kb) = match format.space {
            ColorSpace::Bt601 => (0.299f32, 0.114f32),
            ColorSpace::Bt709 => (0.2126f32, 0.0722f32),
        };

        for (pi, plane) in plan.planes().iter().enumerate() {
            let bx = 1usize << plane.shift_x;
            let by = 1usize << plane.shift_y;
            let pw = plane.width as usize;
            let ph = plane.height as usize;

            for py in 0..ph.min(cover_h.div_ceil(by)) {
                for px in 0..pw.min(cover_w.div_ceil(bx)) {
                    // Average the covered source block.
                    let mut acc = [0.0f32; 3];
                    let mut n = 0.0f32;
                    for dy in 0..by {
                        for dx in 0..bx {
                            let sx = px * bx + dx;
                            let sy = py * by + dy;
                            if sx < src_desc.width as usize && sy < src_desc.height as usize {
                                let c = self.tex(source).texel_rgba(sx, sy);
                                acc[0] += c[0];
                                acc[1] += c[1];
                                acc[2] += c[2];
                                n += 1.0;
                            }
                        }
                    }
                    let (r, g, b) = (acc[0] / n, acc[1] / n, acc[2] / n);

                    let texel = yuv_texel(format.pixel, pi, r, g, b, kr, kb);

                    let t = self.tex_mut(targets[pi]);
                    let elem = t.desc.format.bytes_per_texel();
                    let pitch = t.row_pitch;
                    let i = py * pitch + px * elem;
                    t.bytes_mut()[i..i + texel.len()].copy_from_slice(&texel);
                }
            }
        }
        Ok(())
    }
}

/// One output texel of `plane` for the given averaged RGB.
fn yuv_texel(pixel: PixelFormat, plane: usize, r: f32, g: f32, b: f32, kr: f32, kb: f32) -> Vec<u8> {
    let kg = 1.0 - kr - kb;
    let ey = kr * r + kg * g + kb * b;
    let q = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    let y = q(16.0 + 219.0 * ey);
    let cb = q(128.0 + 224.0 * 0.5 * (b - ey) / (1.0 - kb));
    let cr = q(128.0 + 224.0 * 0.5 * (r - ey) / (1.0 - kr));

    match (pixel, plane) {
        (PixelFormat::Bgr0, 0) => {
            let qf = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            vec![qf(b), qf(g), qf(r), 0]
        }
        (_, 0) => vec![y],
        (PixelFormat::Nv12, 1) => vec![cb, cr],
        (PixelFormat::Nv21, 1) => vec![cr, cb],
        (PixelFormat::Yuv420 | PixelFormat::Yuv422 | PixelFormat::Yuv444, 1) => vec![cb],
        (PixelFormat::Yuv420 | PixelFormat::Yuv422 | PixelFormat::Yuv444, 2) => vec![cr],
        _ => panic!("no plane {plane} in {pixel:?}"),
    }
}

impl RenderBackend for SoftBackend {
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TexHandle> {
        if desc.width == 0 || desc.height == 0 {
            bail!("zero-sized texture");
        }
        let id = self.textures.len() as u32;
        self.textures.push(Some(SoftTex::new(*desc)));
        Ok(TexHandle(id))
    }

    fn create_shared_texture(&mut self, desc: &TextureDesc) -> Result<(TexHandle, KeyedMutex)> {
        let tex = self.create_texture(desc)?;
        let lock = KeyedMutex::new(KEY_GAME);
        self.shared.publish(tex.raw(), lock.clone());
        Ok((tex, lock))
    }

    fn destroy_texture(&mut self, tex: TexHandle) {
        let slot = &mut self.textures[tex.0 as usize];
        if let Some(t) = slot {
            assert!(!t.mapped, "destroying a mapped texture");
        }
        *slot = None;
    }

    fn texture_desc(&self, tex: TexHandle) -> TextureDesc {
        self.tex(tex).desc
    }

    fn copy_texture(&mut self, dest: TexHandle, source: TexHandle) {
        let (d, s) = self.two_tex_mut(dest, source);
        assert_eq!(d.desc.width, s.desc.width, "copy dimension mismatch");
        assert_eq!(d.desc.height, s.desc.height, "copy dimension mismatch");
        assert_eq!(d.desc.format, s.desc.format, "copy format mismatch");
        assert!(!d.mapped, "copy into a mapped staging texture");

        match (&mut d.data, &s.data) {
            (TexData::Floats(df), TexData::Floats(sf)) => df.copy_from_slice(sf),
            (TexData::Bytes(_), TexData::Bytes(_)) => {
                let h = s.desc.height as usize;
                let tight = s.desc.width as usize * s.desc.format.bytes_per_texel();
                let (sp, dp) = (s.row_pitch, d.row_pitch);
                for row in 0..h {
                    let src = &s.bytes()[row * sp..row * sp + tight];
                    d.bytes_mut()[row * dp..row * dp + tight].copy_from_slice(src);
                }
            }
            _ => panic!("copy between float and byte textures"),
        }
    }

    fn clear(&mut self, tex: TexHandle, color: [f32; 4]) {
        let t = self.tex_mut(tex);
        match &mut t.data {
            TexData::Floats(f) => {
                for px in f.chunks_exact_mut(4) {
                    px.copy_from_slice(&color);
                }
            }
            TexData::Bytes(_) => {
                let format = t.desc.format;
                let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                let texel: Vec<u8> = match format {
                    TexFormat::R8 => vec![q(color[0])],
                    TexFormat::Rg8 => vec![q(color[0]), q(color[1])],
                    TexFormat::Rgba8 => vec![q(color[0]), q(color[1]), q(color[2]), q(color[3])],
                    TexFormat::Bgra8 => vec![q(color[2]), q(color[1]), q(color[0]), q(color[3])],
                    TexFormat::Rgba32F => unreachable!(),
                };
                let (w, h) = (t.desc.width as usize, t.desc.height as usize);
                let pitch = t.row_pitch;
                let bytes = t.bytes_mut();
                for y in 0..h {
                    for x in 0..w {
                        let i = y * pitch + x * texel.len();
                        bytes[i..i + texel.len()].copy_from_slice(&texel);
                    }
                }
            }
        }
    }

    fn set_accum_weight(&mut self, weight: f32) {
        self.accum_weight = weight;
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        source: TexHandle,
        targets: &[TexHandle],
        groups: (u32, u32),
    ) -> Result<()> {
        match kernel {
            Kernel::MosampleAccum => {
                let [target] = targets else {
                    bail!("accumulate kernel takes exactly one target");
                };
                let target = *target;
                let src_desc = self.tex(source).desc;
                let dst_desc = self.tex(target).desc;
                assert_eq!(dst_desc.format, TexFormat::Rgba32F, "accumulator must be Rgba32F");
                assert_eq!((src_desc.width, src_desc.height), (dst_desc.width, dst_desc.height));

                let weight = self.accum_weight;
                let cover_w = (groups.0 as usize * 8).min(src_desc.width as usize);
                let cover_h = (groups.1 as usize * 8).min(src_desc.height as usize);

                for y in 0..cover_h {
                    for x in 0..cover_w {
                        let c = self.tex(source).texel_rgba(x, y);
                        let t = self.tex_mut(target);
                        let w = t.desc.width as usize;
                        let TexData::Floats(f) = &mut t.data else { unreachable!() };
                        let i = (y * w + x) * 4;
                        for ch in 0..3 {
                            f[i + ch] += weight * c[ch];
                        }
                    }
                }
                Ok(())
            }
            Kernel::Convert(format) => self.run_convert(format, source, targets, groups),
            Kernel::ResolveBgra => {
                let [target] = targets else {
                    bail!("resolve kernel takes exactly one target");
                };
                let target = *target;
                let dst_desc = self.tex(target).desc;
                assert_eq!(dst_desc.format, TexFormat::Bgra8, "resolve target must be Bgra8");

                let cover_w = (groups.0 as usize * 8).min(dst_desc.width as usize);
                let cover_h = (groups.1 as usize * 8).min(dst_desc.height as usize);
                let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;

                for y in 0..cover_h {
                    for x in 0..cover_w {
                        let c = self.tex(source).texel_rgba(x, y);
                        let t = self.tex_mut(target);
                        let pitch = t.row_pitch;
                        let i = y * pitch + x * 4;
                        let bytes = t.bytes_mut();
                        bytes[i] = q(c[2]);
                        bytes[i + 1] = q(c[1]);
                        bytes[i + 2] = q(c[0]);
                        bytes[i + 3] = q(c[3]);
                    }
                }
                Ok(())
            }
        }
    }

    fn map_staging(&mut self, tex: TexHandle) -> Result<Mapped<'_>> {
        if self.fail_next_map {
            self.fail_next_map = false;
            return Err(anyhow!("staging map failed (device removed)"));
        }
        let t = self.tex_mut(tex);
        assert_eq!(t.desc.usage, TexUsage::Staging, "mapping a non-staging texture");
        assert!(!t.mapped, "texture is already mapped");
        t.mapped = true;
        let pitch = t.row_pitch;
        Ok(Mapped { data: t.bytes(), row_pitch: pitch })
    }

    fn unmap_staging(&mut self, tex: TexHandle) {
        let t = self.tex_mut(tex);
        assert!(t.mapped, "unmap of a texture that is not mapped");
        t.mapped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(w: u32, h: u32, format: TexFormat, usage: TexUsage) -> TextureDesc {
        TextureDesc { width: w, height: h, format, usage }
    }

    #[test]
    fn staging_pitch_is_padded() {
        let mut be = SoftBackend::new();
        // 10 texels of 1 byte → tight pitch 10 → padded to 32.
        let t = be.create_texture(&desc(10, 4, TexFormat::R8, TexUsage::Staging)).unwrap();
        let m = be.map_staging(t).unwrap();
        assert_eq!(m.row_pitch, 32);
        assert_eq!(m.data.len(), 32 * 4);
        be.unmap_staging(t);
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_is_detected() {
        let mut be = SoftBackend::new();
        let t = be.create_texture(&desc(8, 8, TexFormat::R8, TexUsage::Staging)).unwrap();
        let _ = be.map_staging(t);
        let _ = be.map_staging(t);
    }

    #[test]
    #[should_panic(expected = "mapped staging texture")]
    fn copy_into_mapped_staging_is_detected() {
        let mut be = SoftBackend::new();
        let src = be.create_texture(&desc(8, 8, TexFormat::R8, TexUsage::Default)).unwrap();
        let dst = be.create_texture(&desc(8, 8, TexFormat::R8, TexUsage::Staging)).unwrap();
        let _ = be.map_staging(dst);
        be.copy_texture(dst, src);
    }

    #[test]
    fn accumulate_blends_by_weight() {
        let mut be = SoftBackend::new();
        let src = be.create_texture(&desc(8, 8, TexFormat::Bgra8, TexUsage::Default)).unwrap();
        let work = be.create_texture(&desc(8, 8, TexFormat::Rgba32F, TexUsage::Default)).unwrap();

        be.clear(work, [0.0, 0.0, 0.0, 1.0]);
        be.clear(src, [1.0, 1.0, 1.0, 1.0]);

        be.set_accum_weight(0.25);
        be.dispatch(Kernel::MosampleAccum, src, &[work], (1, 1)).unwrap();
        be.dispatch(Kernel::MosampleAccum, src, &[work], (1, 1)).unwrap();

        let px = be.read_rgba(work, 3, 3);
        assert!((px[0] - 0.5).abs() < 1e-6);
        assert!((px[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn convert_grey_hits_yuv_midpoint() {
        let mut be = SoftBackend::new();
        let src = be.create_texture(&desc(16, 16, TexFormat::Bgra8, TexUsage::Default)).unwrap();
        be.clear(src, [0.5, 0.5, 0.5, 1.0]);

        let y = be.create_texture(&desc(16, 16, TexFormat::R8, TexUsage::Default)).unwrap();
        let uv = be.create_texture(&desc(8, 8, TexFormat::Rg8, TexUsage::Default)).unwrap();

        let format = VideoFormat::new(PixelFormat::Nv12, ColorSpace::Bt601);
        be.dispatch(Kernel::Convert(format), src, &[y, uv], (2, 2)).unwrap();

        // Grey 0.5 quantises to 128/255; limited-range Y = 16 + 219 × (128/255).
        let expect_y = (16.0f64 + 219.0 * (128.0 / 255.0)).round() as u8;
        assert_eq!(be.tex(y).bytes()[0], expect_y);
        // Chroma of grey is neutral.
        assert_eq!(&be.tex(uv).bytes()[..2], &[128, 128]);
    }

    #[test]
    fn resolve_packs_bgra_bytes() {
        let mut be = SoftBackend::new();
        let work = be.create_texture(&desc(8, 8, TexFormat::Rgba32F, TexUsage::Default)).unwrap();
        be.clear(work, [1.0, 0.5, 0.0, 1.0]);
        let shared = be.create_texture(&desc(8, 8, TexFormat::Bgra8, TexUsage::Default)).unwrap();

        be.dispatch(Kernel::ResolveBgra, work, &[shared], (1, 1)).unwrap();
        let px = be.read_rgba(shared, 0, 0);
        assert!((px[0] - 1.0).abs() < 0.01);
        assert!((px[1] - 0.5).abs() < 0.01);
        assert!(px[2].abs() < 0.01);
    }

    #[test]
    fn shared_textures_are_openable_by_handle() {
        let mut be = SoftBackend::new();
        let (tex, lock) =
            be.create_shared_texture(&desc(8, 8, TexFormat::Bgra8, TexUsage::Default)).unwrap();
        let table = be.shared_textures();
        let opened = table.open(tex.raw()).expect("published handle");
        // Same underlying lock: a release on one side is visible on the other.
        lock.acquire(KEY_GAME);
        lock.release(super::super::KEY_ENCODER);
        opened.acquire(super::super::KEY_ENCODER);
    }
}
