use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Media::MediaFoundation::{
    IMF2DBuffer, IMFMediaBuffer, IMFSample, MFCreateDXGISurfaceBuffer, MFCreateVideoSampleFromSurface,
};
use windows::core::{IUnknown, Interface};

use super::d3d11::D3D11Texture;
use super::graphics;
use crate::Result;

/// Media Foundation sample wrapping a texture, ready for a hardware encoder.
pub struct D3D11Sample {
    sample: IMFSample,
    buffer: IMFMediaBuffer,
}

unsafe impl Send for D3D11Sample {}
unsafe impl Sync for D3D11Sample {}

impl D3D11Sample {
    pub(super) fn new(texture: &D3D11Texture) -> Result<Self> {
        unsafe {
            let sample = MFCreateVideoSampleFromSurface(None::<&IUnknown>).map_err(graphics("MFCreateVideoSampleFromSurface"))?;
            let buffer = MFCreateDXGISurfaceBuffer(&ID3D11Texture2D::IID, texture.raw(), 0, false)
                .map_err(graphics("MFCreateDXGISurfaceBuffer"))?;

            let buffer_2d: IMF2DBuffer = buffer.cast().map_err(graphics("IMF2DBuffer"))?;
            let len = buffer_2d.GetContiguousLength().map_err(graphics("GetContiguousLength"))?;
            buffer.SetCurrentLength(len).map_err(graphics("SetCurrentLength"))?;
            sample.AddBuffer(&buffer).map_err(graphics("AddBuffer"))?;

            Ok(Self { sample, buffer })
        }
    }

    pub fn sample(&self) -> &IMFSample {
        &self.sample
    }

    pub fn buffer(&self) -> &IMFMediaBuffer {
        &self.buffer
    }
}

impl Drop for D3D11Sample {
    fn drop(&mut self) {
        let _ = unsafe { self.sample.RemoveAllBuffers() };
    }
}
