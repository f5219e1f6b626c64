use dd_capture::{Frame, GpuDevice};
use serde::Serialize;
use std::time::Duration;

use crate::Result;

/// Where a delivered frame sits in the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStamp {
    /// Position in the paced output stream, counting repeats.
    pub sequence: u64,
    /// Time since the engine started.
    pub elapsed: Duration,
}

/// Consumer of captured frames, typically an encoder.
pub trait FrameSink<D: GpuDevice>: Send + 'static {
    fn write_frame(&mut self, stamp: FrameStamp, frame: Frame<D>) -> Result<()>;

    /// The screen did not change; the previous frame should be shown again.
    fn write_repeat(&mut self, _stamp: FrameStamp) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub frames_captured: u64,
    pub repeats: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub bytes_delivered: u64,
    pub capture_errors: u64,
    pub average_capture_time_ms: f64,
}

impl EngineStats {
    pub(crate) fn record_capture_time(&mut self, elapsed: Duration) {
        let samples = (self.frames_captured + self.repeats).max(1) as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.average_capture_time_ms += (ms - self.average_capture_time_ms) / samples;
    }
}
