use tracing::{debug, warn};
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_NOT_CURRENTLY_AVAILABLE, DXGI_ERROR_UNSUPPORTED, DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO,
    DXGI_OUTDUPL_MOVE_RECT, DXGI_OUTDUPL_POINTER_SHAPE_INFO, DXGI_OUTDUPL_POINTER_SHAPE_TYPE_COLOR,
    DXGI_OUTDUPL_POINTER_SHAPE_TYPE_MASKED_COLOR, IDXGIOutputDuplication, IDXGIResource,
};
use windows::core::Interface;

use super::d3d11::D3D11Texture;
use super::monitor;
use crate::geometry::{MoveRect, OutputDescription, Point, Rect};
use crate::platform::{
    DIRTY_RECT_SIZE, FrameInfo, MOVE_RECT_SIZE, OutputDuplication, PointerPosition, PointerShapeInfo, PointerShapeKind,
};
use crate::{CaptureError, Result};

/// Maps duplication failures to the cases callers handle differently.
pub(super) fn duplication_error(e: windows::core::Error) -> CaptureError {
    let code = e.code();
    if code == DXGI_ERROR_WAIT_TIMEOUT {
        CaptureError::Timeout
    } else if code == DXGI_ERROR_NOT_CURRENTLY_AVAILABLE {
        CaptureError::SessionUnavailable
    } else if code == DXGI_ERROR_UNSUPPORTED {
        CaptureError::Unsupported(e.message())
    } else {
        CaptureError::AcquisitionFailed(e.to_string())
    }
}

/// `IDXGIOutputDuplication` for one output. Holds at most one frame at a time.
pub struct DxgiDuplication {
    description: OutputDescription,
    duplication: IDXGIOutputDuplication,
    moves: Vec<DXGI_OUTDUPL_MOVE_RECT>,
    dirty: Vec<RECT>,
}

// Only ever driven from the acquisition thread that owns it.
unsafe impl Send for DxgiDuplication {}

impl DxgiDuplication {
    pub(super) fn new(description: OutputDescription, duplication: IDXGIOutputDuplication) -> Self {
        Self { description, duplication, moves: Vec::new(), dirty: Vec::new() }
    }
}

impl OutputDuplication for DxgiDuplication {
    type Texture = D3D11Texture;

    fn description(&self) -> &OutputDescription {
        &self.description
    }

    fn acquire_next_frame(&mut self, timeout_ms: u32) -> Result<(D3D11Texture, FrameInfo)> {
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        unsafe { self.duplication.AcquireNextFrame(timeout_ms, &mut info, &mut resource) }
            .map_err(duplication_error)?;

        let texture = resource
            .ok_or_else(|| CaptureError::AcquisitionFailed("no desktop resource returned".into()))
            .and_then(|resource| {
                resource
                    .cast::<ID3D11Texture2D>()
                    .map_err(|e| CaptureError::AcquisitionFailed(format!("desktop resource is not a texture: {}", e)))
            });

        let texture = match texture {
            Ok(texture) => texture,
            Err(e) => {
                // The frame is held even though it is unusable.
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Err(e);
            }
        };

        let frame_info = FrameInfo {
            last_present_time: info.LastPresentTime,
            last_mouse_update_time: info.LastMouseUpdateTime,
            accumulated_frames: info.AccumulatedFrames,
            pointer: PointerPosition {
                position: Point::new(info.PointerPosition.Position.x, info.PointerPosition.Position.y),
                visible: info.PointerPosition.Visible.as_bool(),
            },
            total_metadata_buffer_size: info.TotalMetadataBufferSize,
            pointer_shape_buffer_size: info.PointerShapeBufferSize,
        };
        Ok((D3D11Texture::wrap(texture), frame_info))
    }

    fn move_rects(&mut self, out: &mut [MoveRect]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.moves.len() < out.len() {
            self.moves.resize(out.len(), DXGI_OUTDUPL_MOVE_RECT::default());
        }

        let mut written = 0u32;
        unsafe {
            self.duplication.GetFrameMoveRects(
                out.len() as u32 * MOVE_RECT_SIZE,
                self.moves.as_mut_ptr(),
                &mut written,
            )
        }
        .map_err(duplication_error)?;

        let count = (written / MOVE_RECT_SIZE) as usize;
        for (dst, src) in out.iter_mut().zip(&self.moves[..count]) {
            *dst = MoveRect {
                source: Point::new(src.SourcePoint.x, src.SourcePoint.y),
                destination: monitor::rect(&src.DestinationRect),
            };
        }
        Ok(count)
    }

    fn dirty_rects(&mut self, out: &mut [Rect]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.dirty.len() < out.len() {
            self.dirty.resize(out.len(), RECT::default());
        }

        let mut written = 0u32;
        unsafe {
            self.duplication.GetFrameDirtyRects(
                out.len() as u32 * DIRTY_RECT_SIZE,
                self.dirty.as_mut_ptr(),
                &mut written,
            )
        }
        .map_err(duplication_error)?;

        let count = (written / DIRTY_RECT_SIZE) as usize;
        for (dst, src) in out.iter_mut().zip(&self.dirty[..count]) {
            *dst = monitor::rect(src);
        }
        Ok(count)
    }

    fn pointer_shape(&mut self, out: &mut [u8]) -> Result<PointerShapeInfo> {
        let mut required = 0u32;
        let mut info = DXGI_OUTDUPL_POINTER_SHAPE_INFO::default();
        unsafe {
            self.duplication.GetFramePointerShape(
                out.len() as u32,
                out.as_mut_ptr().cast(),
                &mut required,
                &mut info,
            )
        }
        .map_err(duplication_error)?;

        if required as usize > out.len() {
            warn!("Pointer shape needs {} bytes, buffer holds {}", required, out.len());
        }

        let kind = if info.Type == DXGI_OUTDUPL_POINTER_SHAPE_TYPE_COLOR.0 as u32 {
            PointerShapeKind::Color
        } else if info.Type == DXGI_OUTDUPL_POINTER_SHAPE_TYPE_MASKED_COLOR.0 as u32 {
            PointerShapeKind::MaskedColor
        } else {
            PointerShapeKind::Monochrome
        };

        Ok(PointerShapeInfo {
            kind,
            width: info.Width,
            height: info.Height,
            pitch: info.Pitch,
            hot_spot: Point::new(info.HotSpot.x, info.HotSpot.y),
        })
    }

    fn release_frame(&mut self) -> Result<()> {
        unsafe { self.duplication.ReleaseFrame() }.map_err(duplication_error)
    }
}

impl Drop for DxgiDuplication {
    fn drop(&mut self) {
        debug!("Closing duplication of {}", self.description.name);
    }
}
