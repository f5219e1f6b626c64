//! The seam between the capture pipeline and a graphics backend.
//!
//! A backend supplies a [`GpuDevice`] (texture creation, region copies, readback and a
//! minimal textured-quad pipeline) and an [`OutputDuplication`] per monitor output. The
//! pipeline never touches platform handles directly, so the same code drives D3D11 on
//! Windows and the software backend everywhere else.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geometry::{MoveRect, OutputDescription, Point, Rect};
use crate::{CaptureError, Result};

/// Size in bytes of one move rectangle in the platform metadata buffer.
pub const MOVE_RECT_SIZE: u32 = 24;
/// Size in bytes of one dirty rectangle in the platform metadata buffer.
pub const DIRTY_RECT_SIZE: u32 = 16;
/// Bytes per pixel for every surface handled by the pipeline (BGRA8).
pub const BYTES_PER_PIXEL: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    Hardware,
    Warp,
    Reference,
}

/// Order in which device creation is attempted.
pub const DRIVER_PREFERENCE: [DriverType; 3] =
    [DriverType::Hardware, DriverType::Warp, DriverType::Reference];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    /// CPU-readable copy target.
    Staging,
    /// GPU resident, usable as copy target, shader input and render target.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub const fn staging(width: u32, height: u32) -> Self {
        Self { width, height, usage: TextureUsage::Staging }
    }

    pub const fn gpu(width: u32, height: u32) -> Self {
        Self { width, height, usage: TextureUsage::Default }
    }

    pub const fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerPosition {
    pub position: Point,
    pub visible: bool,
}

/// Information returned alongside every acquired desktop surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub last_present_time: i64,
    /// Zero when the frame carries no pointer update.
    pub last_mouse_update_time: i64,
    pub accumulated_frames: u32,
    pub pointer: PointerPosition,
    pub total_metadata_buffer_size: u32,
    pub pointer_shape_buffer_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PointerShapeKind {
    #[default]
    Monochrome,
    Color,
    MaskedColor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerShapeInfo {
    pub kind: PointerShapeKind,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub hot_spot: Point,
}

/// Vertex layout consumed by the blit pipeline: position in device space, then UV.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub tex: [f32; 2],
}

/// A platform duplication handle for one monitor output.
pub trait OutputDuplication: Send + 'static {
    type Texture: Send + 'static;

    fn description(&self) -> &OutputDescription;

    /// Waits up to `timeout_ms` for the next desktop image. Reports `CaptureError::Timeout`
    /// when the screen did not change within the window.
    fn acquire_next_frame(&mut self, timeout_ms: u32) -> Result<(Self::Texture, FrameInfo)>;

    /// Fills `out` with the current frame's move rectangles and returns how many were written.
    fn move_rects(&mut self, out: &mut [MoveRect]) -> Result<usize>;

    /// Fills `out` with the current frame's dirty rectangles and returns how many were written.
    fn dirty_rects(&mut self, out: &mut [Rect]) -> Result<usize>;

    fn pointer_shape(&mut self, out: &mut [u8]) -> Result<PointerShapeInfo>;

    fn release_frame(&mut self) -> Result<()>;
}

pub trait GpuDevice: Send + Sync + 'static {
    type Texture: Clone + Send + Sync + 'static;
    /// Encoder-consumable wrapper around a texture.
    type Sample: Send + Sync + 'static;
    /// Handle through which another device opens a shared texture.
    type SharedHandle: Clone + Send + Sync + 'static;
    type Pipeline: Send + 'static;
    type Duplication: OutputDuplication<Texture = Self::Texture>;

    fn driver_type(&self) -> DriverType;

    fn output_count(&self) -> Result<u32>;

    fn output_description(&self, output: u32) -> Result<OutputDescription>;

    fn duplicate_output(&self, output: u32) -> Result<Self::Duplication>;

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture>;

    fn create_shared_texture(&self, width: u32, height: u32) -> Result<(Self::Texture, Self::SharedHandle)>;

    fn open_shared_texture(&self, handle: &Self::SharedHandle) -> Result<Self::Texture>;

    fn texture_size(&self, texture: &Self::Texture) -> (u32, u32);

    /// Copies `region` of `src` into `dst` with its top-left corner at (`dst_x`, `dst_y`).
    fn copy_region(&self, src: &Self::Texture, region: &Rect, dst: &Self::Texture, dst_x: u32, dst_y: u32);

    /// Reads the texture back as tightly packed BGRA rows.
    fn read_pixels(&self, texture: &Self::Texture, out: &mut [u8]) -> Result<()>;

    fn create_sample(&self, texture: &Self::Texture) -> Result<Self::Sample>;

    /// Binds `target` as render target together with the shader pair and sampler.
    fn create_blit_pipeline(&self, target: &Self::Texture) -> Result<Self::Pipeline>;

    /// Draws `vertices` (six per quad) sampling from `source` into the pipeline target.
    fn draw_quads(&self, pipeline: &mut Self::Pipeline, source: &Self::Texture, vertices: &[Vertex]) -> Result<()>;

    fn lock_shared(&self, _texture: &Self::Texture) -> Result<()> {
        Ok(())
    }

    fn unlock_shared(&self, _texture: &Self::Texture) {}

    fn flush(&self) {}
}

pub trait DeviceFactory: Send + Sync + 'static {
    type Device: GpuDevice;

    fn create(&self, driver: DriverType) -> Result<Self::Device>;
}

/// Creates a device trying hardware, then WARP, then the reference rasterizer.
pub fn create_device<F: DeviceFactory>(factory: &F) -> Result<F::Device> {
    for driver in DRIVER_PREFERENCE {
        match factory.create(driver) {
            Ok(device) => {
                info!("Created {:?} device", driver);
                return Ok(device);
            }
            Err(e) => debug!("{:?} device creation failed: {}", driver, e),
        }
    }

    Err(CaptureError::DeviceCreationFailed)
}
