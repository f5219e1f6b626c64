//! Frames handed to the consumer.

use std::sync::Arc;

use crate::platform::{BYTES_PER_PIXEL, GpuDevice};
use crate::pool::Lease;
use crate::texture::AllocatedTexture;
use crate::{CaptureError, Result};

/// Target size and rate of a frame source, known before the first capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSourceDescriptor {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl FrameSourceDescriptor {
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL as usize
    }

    pub fn frame_len(&self) -> usize {
        self.stride() * self.height as usize
    }
}

/// BGRA pixels in a pooled byte buffer.
pub struct CpuFrame {
    width: u32,
    height: u32,
    buffer: Lease<Vec<u8>>,
}

impl CpuFrame {
    pub(crate) fn new(width: u32, height: u32, buffer: Lease<Vec<u8>>) -> Self {
        Self { width, height, buffer }
    }

    /// Pixel data, or `None` once disposed.
    pub fn data(&self) -> Option<&[u8]> {
        self.buffer.get().map(Vec::as_slice)
    }

    /// Identity of the pooled buffer backing this frame.
    pub fn buffer_id(&self) -> u64 {
        self.buffer.id()
    }
}

/// A pooled GPU texture with its encoder sample.
pub struct GpuFrame<D: GpuDevice> {
    width: u32,
    height: u32,
    device: Arc<D>,
    texture: Lease<AllocatedTexture<D>>,
}

impl<D: GpuDevice> GpuFrame<D> {
    pub(crate) fn new(width: u32, height: u32, device: Arc<D>, texture: Lease<AllocatedTexture<D>>) -> Self {
        Self { width, height, device, texture }
    }

    pub fn texture(&self) -> Option<&D::Texture> {
        self.texture.get().map(|t| &t.texture)
    }

    pub fn sample(&self) -> Option<&D::Sample> {
        self.texture.get().map(|t| &t.sample)
    }

    pub fn texture_id(&self) -> u64 {
        self.texture.id()
    }
}

/// One captured desktop image. Disposing it returns the backing storage to its pool;
/// dropping it has the same effect.
pub enum Frame<D: GpuDevice> {
    Cpu(CpuFrame),
    Gpu(GpuFrame<D>),
}

impl<D: GpuDevice> Frame<D> {
    pub fn width(&self) -> u32 {
        match self {
            Frame::Cpu(frame) => frame.width,
            Frame::Gpu(frame) => frame.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Frame::Cpu(frame) => frame.height,
            Frame::Gpu(frame) => frame.height,
        }
    }

    pub fn stride(&self) -> usize {
        self.width() as usize * BYTES_PER_PIXEL as usize
    }

    pub fn is_disposed(&self) -> bool {
        match self {
            Frame::Cpu(frame) => frame.buffer.is_released(),
            Frame::Gpu(frame) => frame.texture.is_released(),
        }
    }

    /// Copies the first `len` bytes of the frame into `dst`.
    pub fn copy_to(&self, dst: &mut [u8], len: usize) -> Result<()> {
        let frame_len = self.stride() * self.height() as usize;
        if len > dst.len() || len > frame_len {
            return Err(CaptureError::InvalidLength {
                requested: len,
                available: dst.len().min(frame_len),
            });
        }

        match self {
            Frame::Cpu(frame) => {
                let data = frame.data().ok_or(CaptureError::FrameDisposed)?;
                dst[..len].copy_from_slice(&data[..len]);
                Ok(())
            }
            Frame::Gpu(frame) => {
                let texture = frame.texture().ok_or(CaptureError::FrameDisposed)?;
                if len == frame_len {
                    return frame.device.read_pixels(texture, &mut dst[..len]);
                }
                let mut pixels = vec![0u8; frame_len];
                frame.device.read_pixels(texture, &mut pixels)?;
                dst[..len].copy_from_slice(&pixels[..len]);
                Ok(())
            }
        }
    }

    /// Returns the backing storage to its pool. Returns false if it was already returned.
    pub fn dispose(&mut self) -> bool {
        match self {
            Frame::Cpu(frame) => frame.buffer.release(),
            Frame::Gpu(frame) => frame.texture.release(),
        }
    }
}

/// Result of one pull from a frame source.
pub enum Capture<D: GpuDevice> {
    Frame(Frame<D>),
    /// Nothing new since the last frame; the consumer re-presents what it already has.
    Repeat,
}

impl<D: GpuDevice> Capture<D> {
    pub fn is_repeat(&self) -> bool {
        matches!(self, Capture::Repeat)
    }

    pub fn into_frame(self) -> Option<Frame<D>> {
        match self {
            Capture::Frame(frame) => Some(frame),
            Capture::Repeat => None,
        }
    }
}

/// Pull-style frame producer consumed by the encoder side.
pub trait FrameSource: Send {
    type Device: GpuDevice;

    fn descriptor(&self) -> FrameSourceDescriptor;

    fn capture(&mut self) -> Result<Capture<Self::Device>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FrameBufferPool;
    use crate::soft::SoftDevice;
    use crate::texture::TextureAllocator;

    fn cpu_frame(pool: &FrameBufferPool) -> Frame<SoftDevice> {
        let mut lease = pool.acquire();
        if let Some(buffer) = lease.get_mut() {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = i as u8;
            }
        }
        Frame::Cpu(CpuFrame::new(pool.width(), pool.height(), lease))
    }

    #[test]
    fn test_copy_to_round_trip() {
        let pool = FrameBufferPool::new(4, 4);
        let frame = cpu_frame(&pool);

        let mut dst = vec![0u8; 64];
        frame.copy_to(&mut dst, 40).unwrap();
        let expected: Vec<u8> = (0..40).map(|i| i as u8).collect();
        assert_eq!(&dst[..40], expected.as_slice());
        assert!(dst[40..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_copy_to_rejects_oversized_length() {
        let pool = FrameBufferPool::new(2, 2);
        let frame = cpu_frame(&pool);
        let mut dst = vec![0u8; 8];
        assert!(matches!(frame.copy_to(&mut dst, 12), Err(CaptureError::InvalidLength { .. })));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let pool = FrameBufferPool::new(2, 2);
        let mut frame = cpu_frame(&pool);

        assert!(frame.dispose());
        assert!(!frame.dispose());
        assert!(frame.is_disposed());
        assert_eq!(pool.stats().available, 1);
        assert_eq!(pool.stats().outstanding, 0);

        let mut dst = vec![0u8; 16];
        assert_eq!(frame.copy_to(&mut dst, 16), Err(CaptureError::FrameDisposed));
    }

    #[test]
    fn test_gpu_frame_reads_back() {
        let device = Arc::new(SoftDevice::new());
        let allocator = TextureAllocator::new(device.clone(), 2, 1);
        let lease = allocator.acquire().unwrap();
        if let Some(allocated) = lease.get() {
            allocated.texture.fill_rect(&crate::geometry::Rect::new(1, 0, 2, 1), [9, 8, 7, 6]);
        }

        let mut frame = Frame::Gpu(GpuFrame::new(2, 1, device, lease));
        let mut dst = [0u8; 8];
        frame.copy_to(&mut dst, 8).unwrap();
        assert_eq!(&dst[4..], &[9, 8, 7, 6]);

        assert!(frame.dispose());
        assert_eq!(allocator.stats().available, 1);
    }
}
