use dd_capture::{Frame, GpuDevice};
use dd_core::{FrameSink, FrameStamp, Result};
use tracing::{debug, info};

use crate::metrics::MetricsCollector;

/// Reads every frame back and counts it. Repeats count the previous frame again, as an
/// encoder would re-encode it.
pub struct CountingSink {
    last: Vec<u8>,
    metrics: MetricsCollector,
}

impl CountingSink {
    pub fn new() -> Self {
        Self {
            last: Vec::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The most recent frame's pixels.
    pub fn last_frame(&self) -> &[u8] {
        &self.last
    }
}

impl Default for CountingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: GpuDevice> FrameSink<D> for CountingSink {
    fn write_frame(&mut self, stamp: FrameStamp, mut frame: Frame<D>) -> Result<()> {
        let len = frame.stride() * frame.height() as usize;
        self.last.resize(len, 0);
        frame.copy_to(&mut self.last, len)?;
        frame.dispose();

        self.metrics.frames_written += 1;
        self.metrics.bytes_written += len as u64;
        debug!("Frame {} at {:?}", stamp.sequence, stamp.elapsed);
        Ok(())
    }

    fn write_repeat(&mut self, _stamp: FrameStamp) -> Result<()> {
        // Nothing to repeat before the first frame.
        if self.last.is_empty() {
            return Ok(());
        }
        self.metrics.repeats_written += 1;
        self.metrics.bytes_written += self.last.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        info!(
            "Sink finished: {} frames, {} repeats, {} bytes",
            self.metrics.frames_written, self.metrics.repeats_written, self.metrics.bytes_written
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dd_capture::soft::{ScriptedDuplication, ScriptedFrame, SoftDevice};
    use dd_capture::{FrameSource, FrameTarget, OutputDescription, Rect, Rotation, SingleOutputCapturer};
    use std::sync::Arc;
    use std::time::Duration;

    fn capturer(values: &[u8], target: FrameTarget) -> SingleOutputCapturer<SoftDevice> {
        let mut script = ScriptedDuplication::new(OutputDescription {
            name: "SOFT1".into(),
            desktop_bounds: Rect::new(0, 0, 4, 2),
            rotation: Rotation::Identity,
            attached_to_desktop: true,
        })
        .idle_wait(Duration::ZERO);
        for value in values {
            script = script.frame(ScriptedFrame {
                pixels: Some(vec![*value; 4 * 2 * 4]),
                dirty: vec![Rect::new(0, 0, 4, 2)],
                ..Default::default()
            });
        }
        let device = Arc::new(SoftDevice::with_outputs(vec![script]));
        SingleOutputCapturer::new(device, 0, None, target, 30, 20).unwrap()
    }

    fn stamp(sequence: u64) -> FrameStamp {
        FrameStamp { sequence, elapsed: Duration::from_millis(sequence * 33) }
    }

    fn next_frame(capturer: &mut SingleOutputCapturer<SoftDevice>) -> Frame<SoftDevice> {
        loop {
            if let Some(frame) = capturer.capture().unwrap().into_frame() {
                return frame;
            }
        }
    }

    #[test]
    fn test_repeat_before_first_frame_is_skipped() {
        let mut sink = CountingSink::new();
        FrameSink::<SoftDevice>::write_repeat(&mut sink, stamp(0)).unwrap();
        assert_eq!(sink.metrics().repeats_written, 0);
        assert_eq!(sink.metrics().bytes_written, 0);
    }

    #[test]
    fn test_counts_frames_and_repeats() {
        let mut capturer = capturer(&[7, 9], FrameTarget::Cpu);
        let mut sink = CountingSink::new();

        sink.write_frame(stamp(0), next_frame(&mut capturer)).unwrap();
        assert_eq!(sink.last_frame(), &[7u8; 32][..]);
        FrameSink::<SoftDevice>::write_repeat(&mut sink, stamp(1)).unwrap();
        sink.write_frame(stamp(2), next_frame(&mut capturer)).unwrap();
        FrameSink::<SoftDevice>::finish(&mut sink).unwrap();

        assert_eq!(sink.last_frame(), &[9u8; 32][..]);
        assert_eq!(sink.metrics().frames_written, 2);
        assert_eq!(sink.metrics().repeats_written, 1);
        assert_eq!(sink.metrics().bytes_written, 96);
    }

    #[test]
    fn test_frames_go_back_to_pool() {
        let mut capturer = capturer(&[1, 2, 3], FrameTarget::Gpu);
        let mut sink = CountingSink::new();

        for sequence in 0..3 {
            sink.write_frame(stamp(sequence), next_frame(&mut capturer)).unwrap();
        }

        let stats = capturer.pool_stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.created, 1);
    }
}
