// crates/shutter-core/src/plan.rs
//
// Pixel-format conversion table: the closed catalogue of output formats and
// the per-plane layout derived from them.
//
// Layout convention for the contiguous host buffer a converted frame lands
// in (strides removed, each row is exactly plane_width * element bytes):
//   [0 .. p0]          plane 0, packed
//   [p0 .. p0 + p1]    plane 1, packed
//   [.. end]           plane 2, packed (three-plane formats only)
//
// The subsampling shifts are right-shift counts applied to the source
// dimensions, so a 1920×1080 NV12 frame has a 1920×1080 one-byte Y plane
// and a 960×540 two-byte interleaved UV plane. Callers must not request odd
// dimensions for subsampled formats; the shift floors.

use crate::movie::{PixelFormat, VideoFormat};

/// Maximum planes any supported format uses.
pub const MAX_PLANES: usize = 3;

/// Texel width of one plane element.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PlaneFormat {
    /// Single byte per texel (Y, U or V plane).
    U8,
    /// Two bytes per texel (interleaved UV plane of NV12/NV21).
    U8x2,
    /// Four bytes per texel (packed BGR0).
    U8x4,
}

impl PlaneFormat {
    pub fn bytes(self) -> usize {
        match self {
            PlaneFormat::U8 => 1,
            PlaneFormat::U8x2 => 2,
            PlaneFormat::U8x4 => 4,
        }
    }
}

/// Layout of one plane of the output frame.
#[derive(Clone, Copy, Debug)]
pub struct PlanePlan {
    pub width: u32,
    pub height: u32,
    pub format: PlaneFormat,
    pub shift_x: u32,
    pub shift_y: u32,
}

impl PlanePlan {
    /// Bytes in one packed row.
    pub fn tight_pitch(&self) -> usize {
        self.width as usize * self.format.bytes()
    }

    /// Bytes in the whole packed plane.
    pub fn size(&self) -> usize {
        self.tight_pitch() * self.height as usize
    }
}

/// Complete conversion plan for one output format at fixed dimensions.
#[derive(Clone, Debug)]
pub struct ConversionPlan {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    planes: Vec<PlanePlan>,
}

impl ConversionPlan {
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Self {
        let shapes: &[(u32, u32, PlaneFormat)] = match format.pixel {
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                &[(0, 0, PlaneFormat::U8), (1, 1, PlaneFormat::U8x2)]
            }
            PixelFormat::Yuv420 => &[
                (0, 0, PlaneFormat::U8),
                (1, 1, PlaneFormat::U8),
                (1, 1, PlaneFormat::U8),
            ],
            PixelFormat::Yuv422 => &[
                (0, 0, PlaneFormat::U8),
                (1, 0, PlaneFormat::U8),
                (1, 0, PlaneFormat::U8),
            ],
            PixelFormat::Yuv444 => &[
                (0, 0, PlaneFormat::U8),
                (0, 0, PlaneFormat::U8),
                (0, 0, PlaneFormat::U8),
            ],
            PixelFormat::Bgr0 => &[(0, 0, PlaneFormat::U8x4)],
        };

        let planes = shapes
            .iter()
            .map(|&(sx, sy, format)| PlanePlan {
                width: width >> sx,
                height: height >> sy,
                format,
                shift_x: sx,
                shift_y: sy,
            })
            .collect();

        Self { format, width, height, planes }
    }

    pub fn planes(&self) -> &[PlanePlan] {
        &self.planes
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Size of the contiguous host buffer one converted frame occupies.
    /// Invariant: equals the sum of every packed plane.
    pub fn total_size(&self) -> usize {
        self.planes.iter().map(|p| p.size()).sum()
    }

    /// Byte offset of `plane` in the contiguous buffer (prefix sum).
    pub fn plane_offset(&self, plane: usize) -> usize {
        self.planes[..plane].iter().map(|p| p.size()).sum()
    }

    /// Raw-video pixel format name the external codec CLI understands.
    pub fn pix_fmt_text(&self) -> &'static str {
        match self.format.pixel {
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Nv21 => "nv21",
            PixelFormat::Yuv420 => "yuv420p",
            PixelFormat::Yuv422 => "yuv422p",
            PixelFormat::Yuv444 => "yuv444p",
            PixelFormat::Bgr0 => "bgr0",
        }
    }

    /// Colour-space name for the codec CLI. None for RGB output.
    pub fn color_space_text(&self) -> Option<&'static str> {
        use crate::movie::ColorSpace;
        match self.format.pixel {
            PixelFormat::Bgr0 => None,
            _ => Some(match self.format.space {
                ColorSpace::Bt601 => "bt470bg",
                ColorSpace::Bt709 => "bt709",
            }),
        }
    }
}
