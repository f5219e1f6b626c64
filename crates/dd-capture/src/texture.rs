use std::sync::Arc;
use tracing::debug;

use crate::platform::{GpuDevice, TextureDesc};
use crate::pool::{Lease, Pool, PoolStats};
use crate::Result;

/// A GPU texture paired with the encoder sample that wraps it.
pub struct AllocatedTexture<D: GpuDevice> {
    pub texture: D::Texture,
    pub sample: D::Sample,
}

/// Recycles GPU textures (and their samples) of one size for GPU-backed frames.
pub struct TextureAllocator<D: GpuDevice> {
    device: Arc<D>,
    desc: TextureDesc,
    pool: Pool<AllocatedTexture<D>>,
}

impl<D: GpuDevice> TextureAllocator<D> {
    pub fn new(device: Arc<D>, width: u32, height: u32) -> Self {
        Self {
            device,
            desc: TextureDesc::gpu(width, height),
            pool: Pool::new("texture"),
        }
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn acquire(&self) -> Result<Lease<AllocatedTexture<D>>> {
        self.pool.acquire_with(|| {
            let texture = self.device.create_texture(&self.desc)?;
            let sample = self.device.create_sample(&texture)?;
            debug!("Allocated {}x{} frame texture", self.desc.width, self.desc.height);
            Ok(AllocatedTexture { texture, sample })
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftDevice;

    #[test]
    fn test_textures_are_recycled() {
        let device = Arc::new(SoftDevice::new());
        let allocator = TextureAllocator::new(device.clone(), 64, 32);

        let first = allocator.acquire().unwrap();
        let texture_id = first.get().unwrap().texture.id();
        drop(first);

        let second = allocator.acquire().unwrap();
        assert_eq!(second.get().unwrap().texture.id(), texture_id);
        assert_eq!(second.get().unwrap().sample.len(), 64 * 32 * 4);
        assert_eq!(allocator.stats().created, 1);
    }

    #[test]
    fn test_grows_under_pressure() {
        let device = Arc::new(SoftDevice::new());
        let allocator = TextureAllocator::new(device, 8, 8);

        let held: Vec<_> = (0..3).map(|_| allocator.acquire().unwrap()).collect();
        assert_eq!(allocator.stats().created, 3);
        assert_eq!(allocator.stats().outstanding, 3);
        drop(held);
        assert_eq!(allocator.stats().available, 3);
    }
}
