//! D3D11 and DXGI desktop duplication backend.

use std::sync::Arc;
use tracing::{info, warn};
use windows::Win32::Foundation::E_ACCESSDENIED;
use windows::Win32::UI::HiDpi::{DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2, SetProcessDpiAwarenessContext};

use crate::platform::{DeviceFactory, DriverType};
use crate::{CaptureError, Result};

mod d3d11;
mod dd;
mod monitor;
mod sample;

pub use d3d11::{D3D11Device, D3D11Pipeline, D3D11Texture, ShaderBytecode, SharedHandle};
pub use dd::DxgiDuplication;
pub use sample::D3D11Sample;

/// Creates [`D3D11Device`]s on the adapter that owns the desktop outputs.
#[derive(Debug, Clone, Default)]
pub struct D3D11Factory {
    bytecode: Option<Arc<ShaderBytecode>>,
}

impl D3D11Factory {
    /// Makes the process per-monitor DPI aware so duplicated surfaces have the real
    /// output resolution.
    pub fn new() -> Result<Self> {
        match unsafe { SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2) } {
            Ok(()) => info!("Per-monitor DPI awareness enabled"),
            // Already set by a manifest or an earlier call.
            Err(e) if e.code() == E_ACCESSDENIED => {}
            Err(e) => warn!("Failed to set DPI awareness: {}", e),
        }
        Ok(Self::default())
    }

    /// Uses precompiled blit shaders instead of compiling the embedded HLSL.
    pub fn with_shader_bytecode(mut self, bytecode: ShaderBytecode) -> Self {
        self.bytecode = Some(Arc::new(bytecode));
        self
    }
}

impl DeviceFactory for D3D11Factory {
    type Device = D3D11Device;

    fn create(&self, driver: DriverType) -> Result<D3D11Device> {
        D3D11Device::new(driver, self.bytecode.clone())
    }
}

fn graphics(what: &'static str) -> impl FnOnce(windows::core::Error) -> CaptureError {
    move |e| CaptureError::Graphics(format!("{}: {}", what, e))
}
