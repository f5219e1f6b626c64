//! Software graphics backend.
//!
//! Textures live in CPU memory and the blit pipeline is a point-sampling quad
//! rasterizer, so the whole capture pipeline runs on machines without desktop
//! duplication (CI, non-Windows hosts). Outputs are driven by [`ScriptedDuplication`].

mod duplication;
mod raster;

pub use duplication::{
    ScriptCounts, ScriptProbe, ScriptStep, ScriptedDuplication, ScriptedFrame, ScriptedPointer, synthetic_desktop,
};

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::geometry::{OutputDescription, Rect};
use crate::platform::{DeviceFactory, DriverType, GpuDevice, OutputDuplication, TextureDesc, TextureUsage, Vertex};
use crate::{CaptureError, Result};

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

struct SoftSurface {
    id: u64,
    width: u32,
    height: u32,
    usage: TextureUsage,
    pixels: RwLock<Vec<u8>>,
}

/// CPU-memory BGRA texture. Clones share the same pixels.
#[derive(Clone)]
pub struct SoftTexture {
    inner: Arc<SoftSurface>,
}

impl SoftTexture {
    pub fn new(width: u32, height: u32, usage: TextureUsage) -> Self {
        Self::from_pixels(width, height, usage, vec![0u8; width as usize * height as usize * 4])
    }

    pub fn from_pixels(width: u32, height: u32, usage: TextureUsage, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * 4);
        Self {
            inner: Arc::new(SoftSurface {
                id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
                width,
                height,
                usage,
                pixels: RwLock::new(pixels),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.inner.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn usage(&self) -> TextureUsage {
        self.inner.usage
    }

    pub fn pixels(&self) -> Vec<u8> {
        self.inner.pixels.read().clone()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.inner.width as usize + x as usize) * 4;
        let pixels = self.inner.pixels.read();
        [pixels[offset], pixels[offset + 1], pixels[offset + 2], pixels[offset + 3]]
    }

    pub fn fill_rect(&self, rect: &Rect, color: [u8; 4]) {
        let bounds = Rect::from_size(self.inner.width, self.inner.height);
        let rect = clip(rect, &bounds);
        let mut pixels = self.inner.pixels.write();
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                let offset = (y as usize * self.inner.width as usize + x as usize) * 4;
                pixels[offset..offset + 4].copy_from_slice(&color);
            }
        }
    }

    fn same_surface(&self, other: &SoftTexture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SoftTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftTexture")
            .field("id", &self.inner.id)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .finish()
    }
}

/// Sample handed to the encoder side: the texture's identity and contiguous length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftSample {
    texture_id: u64,
    len: usize,
}

impl SoftSample {
    pub fn texture_id(&self) -> u64 {
        self.texture_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
pub struct SoftPipeline {
    target: SoftTexture,
    draws: u64,
}

impl SoftPipeline {
    pub fn draws(&self) -> u64 {
        self.draws
    }
}

#[derive(Default)]
struct OutputRegistry {
    outputs: Vec<ScriptedDuplication>,
}

pub struct SoftDevice {
    driver: DriverType,
    outputs: Arc<OutputRegistry>,
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDevice {
    /// A device with no outputs, for texture work only.
    pub fn new() -> Self {
        Self {
            driver: DriverType::Reference,
            outputs: Arc::new(OutputRegistry::default()),
        }
    }

    pub fn with_outputs(outputs: Vec<ScriptedDuplication>) -> Self {
        Self {
            driver: DriverType::Reference,
            outputs: Arc::new(OutputRegistry { outputs }),
        }
    }
}

impl GpuDevice for SoftDevice {
    type Texture = SoftTexture;
    type Sample = SoftSample;
    type SharedHandle = SoftTexture;
    type Pipeline = SoftPipeline;
    type Duplication = ScriptedDuplication;

    fn driver_type(&self) -> DriverType {
        self.driver
    }

    fn output_count(&self) -> Result<u32> {
        Ok(self.outputs.outputs.len() as u32)
    }

    fn output_description(&self, output: u32) -> Result<OutputDescription> {
        self.outputs
            .outputs
            .get(output as usize)
            .map(|script| script.description().clone())
            .ok_or(CaptureError::OutputNotFound(output))
    }

    fn duplicate_output(&self, output: u32) -> Result<ScriptedDuplication> {
        self.outputs
            .outputs
            .get(output as usize)
            .ok_or(CaptureError::OutputNotFound(output))?
            .claim()
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<SoftTexture> {
        if desc.width == 0 || desc.height == 0 {
            return Err(CaptureError::Graphics(format!("invalid texture size {}x{}", desc.width, desc.height)));
        }
        Ok(SoftTexture::new(desc.width, desc.height, desc.usage))
    }

    fn create_shared_texture(&self, width: u32, height: u32) -> Result<(SoftTexture, SoftTexture)> {
        let texture = self.create_texture(&TextureDesc::gpu(width, height))?;
        Ok((texture.clone(), texture))
    }

    fn open_shared_texture(&self, handle: &SoftTexture) -> Result<SoftTexture> {
        Ok(handle.clone())
    }

    fn texture_size(&self, texture: &SoftTexture) -> (u32, u32) {
        (texture.width(), texture.height())
    }

    fn copy_region(&self, src: &SoftTexture, region: &Rect, dst: &SoftTexture, dst_x: u32, dst_y: u32) {
        let src_bounds = Rect::from_size(src.width(), src.height());
        let region = clip(region, &src_bounds);
        if region.is_empty() {
            return;
        }

        let width = region.width().min(dst.width() as i32 - dst_x as i32);
        let height = region.height().min(dst.height() as i32 - dst_y as i32);
        if width <= 0 || height <= 0 {
            return;
        }

        let row_len = width as usize * 4;
        let mut rows = Vec::with_capacity(row_len * height as usize);
        {
            let pixels = src.inner.pixels.read();
            for y in 0..height {
                let offset = ((region.top + y) as usize * src.width() as usize + region.left as usize) * 4;
                rows.extend_from_slice(&pixels[offset..offset + row_len]);
            }
        }

        let mut pixels = dst.inner.pixels.write();
        for y in 0..height as usize {
            let offset = ((dst_y as usize + y) * dst.width() as usize + dst_x as usize) * 4;
            pixels[offset..offset + row_len].copy_from_slice(&rows[y * row_len..(y + 1) * row_len]);
        }
    }

    fn read_pixels(&self, texture: &SoftTexture, out: &mut [u8]) -> Result<()> {
        let pixels = texture.inner.pixels.read();
        if out.len() < pixels.len() {
            return Err(CaptureError::InvalidLength {
                requested: pixels.len(),
                available: out.len(),
            });
        }
        out[..pixels.len()].copy_from_slice(&pixels);
        Ok(())
    }

    fn create_sample(&self, texture: &SoftTexture) -> Result<SoftSample> {
        Ok(SoftSample {
            texture_id: texture.id(),
            len: texture.width() as usize * texture.height() as usize * 4,
        })
    }

    fn create_blit_pipeline(&self, target: &SoftTexture) -> Result<SoftPipeline> {
        debug!("Soft blit pipeline bound to texture {}", target.id());
        Ok(SoftPipeline {
            target: target.clone(),
            draws: 0,
        })
    }

    fn draw_quads(&self, pipeline: &mut SoftPipeline, source: &SoftTexture, vertices: &[Vertex]) -> Result<()> {
        if source.same_surface(&pipeline.target) {
            return Err(CaptureError::Graphics("source is bound as render target".into()));
        }

        let texels = source.pixels();
        let mut target = pipeline.target.inner.pixels.write();
        raster::draw_quads(
            &mut target,
            (pipeline.target.width(), pipeline.target.height()),
            &texels,
            (source.width(), source.height()),
            vertices,
        );
        pipeline.draws += 1;
        Ok(())
    }
}

/// Hands out [`SoftDevice`]s that share one set of scripted outputs.
pub struct SoftDeviceFactory {
    outputs: Arc<OutputRegistry>,
    failing: Vec<DriverType>,
    attempts: Mutex<Vec<DriverType>>,
}

impl SoftDeviceFactory {
    pub fn new(outputs: Vec<ScriptedDuplication>) -> Self {
        Self {
            outputs: Arc::new(OutputRegistry { outputs }),
            failing: Vec::new(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Makes device creation fail for the given driver types.
    pub fn failing_drivers(mut self, drivers: &[DriverType]) -> Self {
        self.failing = drivers.to_vec();
        self
    }

    /// Driver types requested so far, in order.
    pub fn attempts(&self) -> Vec<DriverType> {
        self.attempts.lock().clone()
    }
}

impl DeviceFactory for SoftDeviceFactory {
    type Device = SoftDevice;

    fn create(&self, driver: DriverType) -> Result<SoftDevice> {
        self.attempts.lock().push(driver);
        if self.failing.contains(&driver) {
            return Err(CaptureError::Graphics(format!("{:?} driver unavailable", driver)));
        }

        Ok(SoftDevice {
            driver,
            outputs: self.outputs.clone(),
        })
    }
}

fn clip(rect: &Rect, bounds: &Rect) -> Rect {
    Rect::new(
        rect.left.max(bounds.left),
        rect.top.max(bounds.top),
        rect.right.min(bounds.right),
        rect.bottom.min(bounds.bottom),
    )
}
