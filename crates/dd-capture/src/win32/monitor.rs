use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_NOT_FOUND, DXGI_MODE_ROTATION, DXGI_MODE_ROTATION_ROTATE90, DXGI_MODE_ROTATION_ROTATE180,
    DXGI_MODE_ROTATION_ROTATE270, IDXGIAdapter, IDXGIOutput,
};

use super::graphics;
use crate::geometry::{OutputDescription, Rect, Rotation};
use crate::{CaptureError, Result};

pub(super) fn output(adapter: &IDXGIAdapter, index: u32) -> Result<IDXGIOutput> {
    unsafe { adapter.EnumOutputs(index) }.map_err(|e| {
        if e.code() == DXGI_ERROR_NOT_FOUND {
            CaptureError::OutputNotFound(index)
        } else {
            CaptureError::Graphics(format!("EnumOutputs({}): {}", index, e))
        }
    })
}

pub(super) fn count(adapter: &IDXGIAdapter) -> Result<u32> {
    let mut index = 0;
    loop {
        match output(adapter, index) {
            Ok(_) => index += 1,
            Err(CaptureError::OutputNotFound(_)) => return Ok(index),
            Err(e) => return Err(e),
        }
    }
}

pub(super) fn describe(output: &IDXGIOutput) -> Result<OutputDescription> {
    let desc = unsafe { output.GetDesc() }.map_err(graphics("IDXGIOutput::GetDesc"))?;

    let len = desc.DeviceName.iter().position(|&c| c == 0).unwrap_or(desc.DeviceName.len());
    Ok(OutputDescription {
        name: String::from_utf16_lossy(&desc.DeviceName[..len]),
        desktop_bounds: rect(&desc.DesktopCoordinates),
        rotation: rotation(desc.Rotation),
        attached_to_desktop: desc.AttachedToDesktop.as_bool(),
    })
}

pub(super) fn rect(rect: &RECT) -> Rect {
    Rect::new(rect.left, rect.top, rect.right, rect.bottom)
}

fn rotation(rotation: DXGI_MODE_ROTATION) -> Rotation {
    match rotation {
        DXGI_MODE_ROTATION_ROTATE90 => Rotation::Rotate90,
        DXGI_MODE_ROTATION_ROTATE180 => Rotation::Rotate180,
        DXGI_MODE_ROTATION_ROTATE270 => Rotation::Rotate270,
        // Identity and unspecified.
        _ => Rotation::Identity,
    }
}
