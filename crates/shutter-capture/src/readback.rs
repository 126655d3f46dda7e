// crates/shutter-capture/src/readback.rs
//
// Conversion and download: turn one RGBA frame into the encoder-native
// planar format and land it, tightly packed, in host memory.
//
// Per frame: dispatch the conversion kernel into the per-plane targets,
// copy each target into its staging ring slot, map each slot and walk the
// rows, reading at whatever pitch the driver reports and writing the
// tight pitch, then unmap and advance the rings. Destination offsets are
// the running prefix sum of the packed plane sizes, so the output buffer
// has no gaps and no overruns whatever the driver padding was.

use anyhow::{ensure, Context, Result};
use shutter_core::movie::MovieParams;
use shutter_core::plan::{ConversionPlan, PlaneFormat};

use crate::render::{dispatch_groups, Kernel, RenderBackend, TexFormat, TexHandle, TexUsage, TextureDesc};
use crate::staging::StagingRing;

pub struct ReadbackPipeline {
    plan: ConversionPlan,
    conv_texs: Vec<TexHandle>,
    rings: Vec<StagingRing>,
    groups: (u32, u32),
}

fn plane_tex_format(format: PlaneFormat) -> TexFormat {
    match format {
        PlaneFormat::U8 => TexFormat::R8,
        PlaneFormat::U8x2 => TexFormat::Rg8,
        PlaneFormat::U8x4 => TexFormat::Rgba8,
    }
}

impl ReadbackPipeline {
    /// Allocate the conversion targets and one staging ring per plane.
    /// Everything allocated so far is released if any allocation fails.
    pub fn start(backend: &mut dyn RenderBackend, params: &MovieParams) -> Result<Self> {
        let plan = ConversionPlan::new(params.format, params.width, params.height);

        let mut conv_texs = Vec::with_capacity(plan.plane_count());
        let mut rings = Vec::with_capacity(plan.plane_count());

        let result = (|| -> Result<()> {
            for plane in plan.planes() {
                let desc = TextureDesc {
                    width: plane.width,
                    height: plane.height,
                    format: plane_tex_format(plane.format),
                    usage: TexUsage::Default,
                };
                conv_texs.push(
                    backend
                        .create_texture(&desc)
                        .context("conversion plane texture")?,
                );
                rings.push(StagingRing::create(backend, desc).context("staging ring")?);
            }
            Ok(())
        })();

        if let Err(e) = result {
            for tex in conv_texs.drain(..) {
                backend.destroy_texture(tex);
            }
            for ring in rings.drain(..) {
                ring.destroy(backend);
            }
            return Err(e.context("readback start failed"));
        }

        let groups = (dispatch_groups(params.width), dispatch_groups(params.height));
        Ok(Self { plan, conv_texs, rings, groups })
    }

    pub fn plan(&self) -> &ConversionPlan {
        &self.plan
    }

    /// Convert `source` and download every plane into `dest`, which must be
    /// exactly the plan's total size.
    pub fn convert_and_download(
        &mut self,
        backend: &mut dyn RenderBackend,
        source: TexHandle,
        dest: &mut [u8],
    ) -> Result<()> {
        ensure!(
            dest.len() == self.plan.total_size(),
            "destination buffer is {} bytes, plan needs {}",
            dest.len(),
            self.plan.total_size()
        );

        backend.dispatch(Kernel::Convert(self.plan.format), source, &self.conv_texs, self.groups)?;

        // Queue all plane copies before the first map so later copies
        // overlap the earlier maps.
        for (tex, ring) in self.conv_texs.iter().zip(&self.rings) {
            backend.copy_texture(ring.current(), *tex);
        }

        let mut offset = 0usize;
        for (plane, ring) in self.plan.planes().iter().zip(&self.rings) {
            let tight = plane.tight_pitch();
            let height = plane.height as usize;
            let staging = ring.current();

            let mapped = backend
                .map_staging(staging)
                .context("staging map during readback")?;
            for row in 0..height {
                let src = &mapped.data[row * mapped.row_pitch..row * mapped.row_pitch + tight];
                dest[offset + row * tight..offset + (row + 1) * tight].copy_from_slice(src);
            }
            backend.unmap_staging(staging);

            offset += plane.size();
        }

        for ring in &mut self.rings {
            ring.advance();
        }
        Ok(())
    }

    pub fn stop(self, backend: &mut dyn RenderBackend) {
        for tex in self.conv_texs {
            backend.destroy_texture(tex);
        }
        for ring in self.rings {
            ring.destroy(backend);
        }
    }
}
