//! Single monitor capture: acquire, copy the capture region, hand the copy out.

use std::sync::Arc;
use tracing::{debug, info};

use crate::frame::{Capture, FrameSource, FrameSourceDescriptor};
use crate::geometry::{OutputDescription, Rect};
use crate::platform::GpuDevice;
use crate::pool::PoolStats;
use crate::readback::FrameReadback;
use crate::session::{Acquired, CaptureSession};
use crate::{CaptureError, FrameTarget, Result};

pub struct SingleOutputCapturer<D: GpuDevice> {
    device: Arc<D>,
    output: u32,
    description: OutputDescription,
    /// `None` captures the whole output.
    requested_region: Option<Rect>,
    region: Rect,
    fps: u32,
    timeout_ms: u32,
    session: Option<CaptureSession<D::Texture>>,
    readback: FrameReadback<D>,
    started: bool,
}

impl<D: GpuDevice> SingleOutputCapturer<D> {
    /// Opens a duplication session on `output`. `region` defaults to the whole output.
    pub fn new(
        device: Arc<D>,
        output: u32,
        region: Option<Rect>,
        target: FrameTarget,
        fps: u32,
        timeout_ms: u32,
    ) -> Result<Self> {
        let (description, resolved, session) = open_session(device.as_ref(), output, region)?;
        let readback = FrameReadback::new(device.clone(), target, resolved.width() as u32, resolved.height() as u32)?;

        info!(
            "Single output capturer on {} ({:?}), region {:?}, target {:?}",
            description.name, description.rotation, resolved, target
        );

        Ok(Self {
            device,
            output,
            description,
            requested_region: region,
            region: resolved,
            fps,
            timeout_ms,
            session: Some(session),
            readback,
            started: false,
        })
    }

    pub fn description(&self) -> &OutputDescription {
        &self.description
    }

    pub fn region(&self) -> Rect {
        self.region
    }

    pub fn target(&self) -> FrameTarget {
        self.readback.target()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.readback.stats()
    }

    /// Recreates the duplication session after a recoverable failure such as access
    /// lost on a mode change. The output description is re-read and the region checked
    /// against it again; the next capture is a startup repeat.
    pub fn reinitialize(&mut self) -> Result<()> {
        info!("Reinitializing capture session for output {}", self.output);

        // The old session has to let go of the output before it can be duplicated again.
        self.session = None;
        self.started = false;

        let (description, region, session) = open_session(self.device.as_ref(), self.output, self.requested_region)?;
        if (region.width(), region.height()) != (self.region.width(), self.region.height()) {
            info!("Output {} resized to {}x{}", self.output, region.width(), region.height());
            self.readback = FrameReadback::new(
                self.device.clone(),
                self.readback.target(),
                region.width() as u32,
                region.height() as u32,
            )?;
        }

        self.description = description;
        self.region = region;
        self.session = Some(session);
        Ok(())
    }
}

impl<D: GpuDevice> FrameSource for SingleOutputCapturer<D> {
    type Device = D;

    fn descriptor(&self) -> FrameSourceDescriptor {
        FrameSourceDescriptor {
            width: self.region.width() as u32,
            height: self.region.height() as u32,
            frame_rate: self.fps,
        }
    }

    fn capture(&mut self) -> Result<Capture<D>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CaptureError::AcquisitionFailed("capture session is not open".into()))?;

        if !self.started {
            session.begin_acquire(self.timeout_ms)?;
            self.started = true;
            return Ok(Capture::Repeat);
        }

        let frame = match session.try_acquire(self.timeout_ms)? {
            Acquired::Timeout => {
                debug!("Output {} idle, repeating previous frame", self.output);
                session.begin_acquire(self.timeout_ms)?;
                return Ok(Capture::Repeat);
            }
            Acquired::Frame(frame) => frame,
        };

        // The platform frame goes back (and the next acquisition is queued) as soon as
        // the copy is issued; readback happens after.
        let staged = self.readback.stage(&frame.surface, &self.region);
        session.release(frame)?;
        session.begin_acquire(self.timeout_ms)?;
        Ok(Capture::Frame(self.readback.finish(staged?)?))
    }
}

fn open_session<D: GpuDevice>(
    device: &D,
    output: u32,
    region: Option<Rect>,
) -> Result<(OutputDescription, Rect, CaptureSession<D::Texture>)> {
    let description = device.output_description(output)?;
    let (width, height) = description.surface_size();
    let bounds = Rect::from_size(width, height);
    let region = region.unwrap_or(bounds);
    if region.is_empty() || !bounds.contains_rect(&region) {
        return Err(CaptureError::InvalidRegion(region));
    }

    let duplication = device.duplicate_output(output)?;
    let session = CaptureSession::start(output, duplication)?;
    Ok((description, region, session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation;
    use crate::soft::{ScriptStep, ScriptedDuplication, ScriptedFrame, SoftDevice};
    use std::time::Duration;

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| [(i % 251) as u8, (i / 251) as u8, 0x80, 0xff])
            .collect()
    }

    fn device(script: ScriptedDuplication) -> Arc<SoftDevice> {
        Arc::new(SoftDevice::with_outputs(vec![script]))
    }

    fn script(width: i32, height: i32) -> ScriptedDuplication {
        ScriptedDuplication::new(OutputDescription {
            name: "SOFT1".into(),
            desktop_bounds: Rect::new(0, 0, width, height),
            rotation: Rotation::Identity,
            attached_to_desktop: true,
        })
        .idle_wait(Duration::ZERO)
    }

    #[test]
    fn test_first_capture_is_repeat() {
        let pixels = gradient(8, 8);
        let device = device(script(8, 8).frame(ScriptedFrame { pixels: Some(pixels.clone()), ..Default::default() }));
        let mut capturer = SingleOutputCapturer::new(device, 0, None, FrameTarget::Cpu, 30, 100).unwrap();

        assert!(capturer.capture().unwrap().is_repeat());
        let frame = capturer.capture().unwrap().into_frame().unwrap();
        let mut out = vec![0u8; pixels.len()];
        frame.copy_to(&mut out, pixels.len()).unwrap();
        assert_eq!(out, pixels);
    }

    #[test]
    fn test_region_copy() {
        let pixels = gradient(16, 8);
        let device = device(script(16, 8).frame(ScriptedFrame { pixels: Some(pixels.clone()), ..Default::default() }));
        let region = Rect::new(4, 2, 12, 6);
        let mut capturer = SingleOutputCapturer::new(device, 0, Some(region), FrameTarget::Gpu, 60, 100).unwrap();

        let descriptor = capturer.descriptor();
        assert_eq!((descriptor.width, descriptor.height, descriptor.frame_rate), (8, 4, 60));

        capturer.capture().unwrap();
        let frame = capturer.capture().unwrap().into_frame().unwrap();
        let mut out = vec![0u8; 8 * 4 * 4];
        let len = out.len();
        frame.copy_to(&mut out, len).unwrap();

        let first_row = &pixels[(2 * 16 + 4) * 4..(2 * 16 + 12) * 4];
        assert_eq!(&out[..32], first_row);
    }

    #[test]
    fn test_region_outside_output() {
        let device = device(script(16, 8));
        let result = SingleOutputCapturer::new(device, 0, Some(Rect::new(8, 0, 24, 8)), FrameTarget::Cpu, 30, 100);
        assert!(matches!(result, Err(CaptureError::InvalidRegion(_))));
    }

    #[test]
    fn test_reinitialize_after_access_lost() {
        let script = script(4, 4)
            .step(ScriptStep::Fail(CaptureError::AcquisitionFailed("access lost".into())))
            .frame(ScriptedFrame::default());
        let mut capturer = SingleOutputCapturer::new(device(script), 0, None, FrameTarget::Cpu, 30, 100).unwrap();

        capturer.capture().unwrap();
        let err = capturer.capture().err().unwrap();
        assert!(err.is_recoverable());

        capturer.reinitialize().unwrap();
        assert!(capturer.capture().unwrap().is_repeat());
        assert!(capturer.capture().unwrap().into_frame().is_some());
    }
}
