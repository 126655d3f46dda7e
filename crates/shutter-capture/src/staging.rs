// crates/shutter-capture/src/staging.rs
//
// Rotation of staging textures for one plane. Copying GPU→staging and
// mapping staging→host are decoupled by the ring: while the newest copy is
// still in flight, the previous slot is the one being mapped.

use anyhow::Result;

use crate::render::{RenderBackend, TexHandle, TexUsage, TextureDesc};

/// Ring depth. Must stay a power of two so `advance` is a mask.
pub const STAGING_RING_DEPTH: usize = 2;
const _: () = assert!(STAGING_RING_DEPTH.is_power_of_two());

pub struct StagingRing {
    texs: [TexHandle; STAGING_RING_DEPTH],
    index: usize,
}

impl StagingRing {
    /// Create the ring's staging textures for one plane.
    pub fn create(backend: &mut dyn RenderBackend, mut desc: TextureDesc) -> Result<Self> {
        desc.usage = TexUsage::Staging;

        let mut texs = [TexHandle(0); STAGING_RING_DEPTH];
        for (i, slot) in texs.iter_mut().enumerate() {
            match backend.create_texture(&desc) {
                Ok(t) => *slot = t,
                Err(e) => {
                    for tex in &texs[..i] {
                        backend.destroy_texture(*tex);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { texs, index: 0 })
    }

    /// The slot the next copy (and subsequent map) targets.
    pub fn current(&self) -> TexHandle {
        self.texs[self.index]
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1) & (STAGING_RING_DEPTH - 1);
    }

    pub fn destroy(self, backend: &mut dyn RenderBackend) {
        for tex in self.texs {
            backend.destroy_texture(tex);
        }
    }
}
