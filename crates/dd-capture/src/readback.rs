//! Turning a region of a GPU surface into a consumer frame.
//!
//! Copying is split in two so the caller can give the source surface back (release the
//! platform frame, unlock the shared surface) as soon as the GPU copy is queued, before
//! the slower CPU readback.

use std::sync::Arc;

use crate::frame::{CpuFrame, Frame, GpuFrame};
use crate::geometry::Rect;
use crate::platform::{GpuDevice, TextureDesc};
use crate::pool::{FrameBufferPool, Lease, PoolStats};
use crate::texture::{AllocatedTexture, TextureAllocator};
use crate::{FrameTarget, Result};

enum Storage<D: GpuDevice> {
    Cpu { staging: D::Texture, buffers: FrameBufferPool },
    Gpu { textures: TextureAllocator<D> },
}

/// A copy that has been queued but not yet turned into a frame.
pub(crate) enum Staged<D: GpuDevice> {
    Cpu,
    Gpu(Lease<AllocatedTexture<D>>),
}

pub(crate) struct FrameReadback<D: GpuDevice> {
    device: Arc<D>,
    width: u32,
    height: u32,
    storage: Storage<D>,
}

impl<D: GpuDevice> FrameReadback<D> {
    pub(crate) fn new(device: Arc<D>, target: FrameTarget, width: u32, height: u32) -> Result<Self> {
        let storage = match target {
            FrameTarget::Cpu => Storage::Cpu {
                staging: device.create_texture(&TextureDesc::staging(width, height))?,
                buffers: FrameBufferPool::new(width, height),
            },
            FrameTarget::Gpu => Storage::Gpu {
                textures: TextureAllocator::new(device.clone(), width, height),
            },
        };
        Ok(Self { device, width, height, storage })
    }

    pub(crate) fn target(&self) -> FrameTarget {
        match self.storage {
            Storage::Cpu { .. } => FrameTarget::Cpu,
            Storage::Gpu { .. } => FrameTarget::Gpu,
        }
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        match &self.storage {
            Storage::Cpu { buffers, .. } => buffers.stats(),
            Storage::Gpu { textures } => textures.stats(),
        }
    }

    /// Queues the copy of `region` of `src`. The source may be released afterwards.
    pub(crate) fn stage(&self, src: &D::Texture, region: &Rect) -> Result<Staged<D>> {
        match &self.storage {
            Storage::Cpu { staging, .. } => {
                self.device.copy_region(src, region, staging, 0, 0);
                Ok(Staged::Cpu)
            }
            Storage::Gpu { textures } => {
                let lease = textures.acquire()?;
                if let Some(allocated) = lease.get() {
                    self.device.copy_region(src, region, &allocated.texture, 0, 0);
                }
                Ok(Staged::Gpu(lease))
            }
        }
    }

    pub(crate) fn finish(&self, staged: Staged<D>) -> Result<Frame<D>> {
        match (staged, &self.storage) {
            (Staged::Gpu(lease), _) => Ok(Frame::Gpu(GpuFrame::new(self.width, self.height, self.device.clone(), lease))),
            (Staged::Cpu, Storage::Cpu { staging, buffers }) => {
                let mut lease = buffers.acquire();
                if let Some(buffer) = lease.get_mut() {
                    self.device.read_pixels(staging, buffer)?;
                }
                Ok(Frame::Cpu(CpuFrame::new(self.width, self.height, lease)))
            }
            (Staged::Cpu, Storage::Gpu { .. }) => Err(crate::CaptureError::Graphics(
                "CPU copy staged on a GPU readback".into(),
            )),
        }
    }
}
