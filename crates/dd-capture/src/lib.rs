//! Desktop duplication capture and compositing pipeline.
//!
//! ```text
//! OutputDuplication ──► CaptureSession (background acquire, 1 in flight)
//!                          │
//!          ┌───────────────┴────────────────┐
//!          ▼                                ▼
//!  SingleOutputCapturer            CaptureOrchestrator (worker per output)
//!   region copy ─► pool              SurfaceCompositor ─► shared surface
//!          │                         PointerTracker   ─► merged pointer
//!          └──────────► Frame (CPU buffer | GPU texture) ◄──────┘
//! ```

#[cfg(windows)]
pub mod win32;

pub mod compositor;
pub mod frame;
pub mod geometry;
pub mod metadata;
pub mod orchestrator;
pub mod platform;
pub mod pointer;
pub mod pool;
mod readback;
pub mod session;
pub mod single;
pub mod soft;
pub mod texture;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use compositor::SurfaceCompositor;
pub use frame::{Capture, CpuFrame, Frame, FrameSource, FrameSourceDescriptor, GpuFrame};
pub use geometry::{MoveRect, OutputDescription, Point, Rect, Rotation};
pub use metadata::FrameMetadata;
pub use orchestrator::{CaptureOrchestrator, OrchestratorConfig};
pub use platform::{DeviceFactory, DriverType, FrameInfo, GpuDevice, OutputDuplication};
pub use pointer::{PointerSnapshot, PointerTracker, PointerUpdate};
pub use pool::{FrameBufferPool, Lease, Pool, PoolStats};
pub use session::{Acquired, CaptureSession, DuplicatedFrame};
pub use single::SingleOutputCapturer;
pub use texture::{AllocatedTexture, TextureAllocator};

/// Acquire timeout used by the single-output path.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u32 = 5000;
/// Poll timeout used by each multi-output worker; bounds shutdown latency.
pub const DEFAULT_POLL_TIMEOUT_MS: u32 = 500;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Timeout waiting for frame")]
    Timeout,

    #[error("The maximum number of applications using desktop duplication is already running, close one of them and try again")]
    SessionUnavailable,

    #[error("Desktop duplication is not supported on this system ({0}). If you have multiple graphics cards, try running on the integrated graphics")]
    Unsupported(String),

    #[error("Failed to acquire frame: {0}")]
    AcquisitionFailed(String),

    #[error("Device creation failed for every driver type")]
    DeviceCreationFailed,

    #[error("Output {0} not found")]
    OutputNotFound(u32),

    #[error("Invalid capture region {0:?}")]
    InvalidRegion(Rect),

    #[error("Frame already disposed")]
    FrameDisposed,

    #[error("Copy of {requested} bytes does not fit (available {available})")]
    InvalidLength { requested: usize, available: usize },

    #[error("Graphics error: {0}")]
    Graphics(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CaptureError {
    /// Errors after which recreating the duplication session may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::SessionUnavailable | CaptureError::AcquisitionFailed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameTarget {
    /// Frames are read back into pooled byte buffers.
    Cpu,
    /// Frames stay on the GPU in pooled textures with an encoder sample attached.
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CaptureMode {
    /// One monitor, optionally restricted to a region of it.
    Single { output: u32, region: Option<Rect> },
    /// All monitors composited into one desktop-sized surface, or only `output` when set.
    Desktop { output: Option<u32> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    pub target: FrameTarget,
    pub fps: u32,
    pub acquire_timeout_ms: u32,
    pub poll_timeout_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Single { output: 0, region: None },
            target: FrameTarget::Cpu,
            fps: 30,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 || self.fps > 240 {
            return Err(CaptureError::InvalidConfig("fps must be 1-240".into()));
        }
        if self.acquire_timeout_ms == 0 || self.poll_timeout_ms == 0 {
            return Err(CaptureError::InvalidConfig("timeouts must be non-zero".into()));
        }
        if let CaptureMode::Single { region: Some(region), .. } = &self.mode {
            if region.is_empty() {
                return Err(CaptureError::InvalidRegion(*region));
            }
        }
        Ok(())
    }
}

/// Capture manager that picks the single-output or compositing path from the config.
pub enum ScreenCaptureManager<F: DeviceFactory> {
    Single(SingleOutputCapturer<F::Device>),
    Desktop(CaptureOrchestrator<F>),
}

impl<F: DeviceFactory> ScreenCaptureManager<F> {
    pub fn new(factory: Arc<F>, config: &CaptureConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!("Creating screen capture manager: {:?}", config.mode);

        match &config.mode {
            CaptureMode::Single { output, region } => {
                let device = Arc::new(platform::create_device(factory.as_ref())?);
                let capturer = SingleOutputCapturer::new(
                    device,
                    *output,
                    *region,
                    config.target,
                    config.fps,
                    config.acquire_timeout_ms,
                )?;
                Ok(Self::Single(capturer))
            }
            CaptureMode::Desktop { output } => {
                let orchestrator = CaptureOrchestrator::start(
                    factory,
                    OrchestratorConfig {
                        output: *output,
                        poll_timeout_ms: config.poll_timeout_ms,
                        target: config.target,
                        fps: config.fps,
                    },
                )?;
                Ok(Self::Desktop(orchestrator))
            }
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        match self {
            Self::Single(capturer) => capturer.pool_stats(),
            Self::Desktop(orchestrator) => orchestrator.pool_stats(),
        }
    }

    /// Merged pointer state. Only the compositing path tracks the pointer.
    pub fn pointer(&self) -> Option<PointerSnapshot> {
        match self {
            Self::Single(_) => None,
            Self::Desktop(orchestrator) => Some(orchestrator.pointer()),
        }
    }
}

impl<F: DeviceFactory> FrameSource for ScreenCaptureManager<F> {
    type Device = F::Device;

    fn descriptor(&self) -> FrameSourceDescriptor {
        match self {
            Self::Single(capturer) => capturer.descriptor(),
            Self::Desktop(orchestrator) => orchestrator.descriptor(),
        }
    }

    fn capture(&mut self) -> Result<Capture<F::Device>> {
        match self {
            Self::Single(capturer) => capturer.capture(),
            Self::Desktop(orchestrator) => orchestrator.capture(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = CaptureConfig::default();
        assert!(config.validate().is_ok());

        config.fps = 0;
        assert!(config.validate().is_err());

        config.fps = 60;
        config.mode = CaptureMode::Single { output: 0, region: Some(Rect::new(10, 10, 10, 50)) };
        assert!(matches!(config.validate(), Err(CaptureError::InvalidRegion(_))));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(CaptureError::SessionUnavailable.is_recoverable());
        assert!(CaptureError::AcquisitionFailed("access lost".into()).is_recoverable());
        assert!(!CaptureError::Unsupported("driver".into()).is_recoverable());
        assert!(!CaptureError::DeviceCreationFailed.is_recoverable());
    }
}
