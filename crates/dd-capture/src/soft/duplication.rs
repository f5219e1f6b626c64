use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::SoftTexture;
use crate::geometry::{MoveRect, OutputDescription, Point, Rect};
use crate::platform::{
    DIRTY_RECT_SIZE, FrameInfo, MOVE_RECT_SIZE, OutputDuplication, PointerPosition, PointerShapeInfo, TextureUsage,
};
use crate::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedPointer {
    pub timestamp: i64,
    pub position: Point,
    pub visible: bool,
}

/// One desktop update as the platform would report it.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFrame {
    /// Full surface contents. `None` keeps the previous image.
    pub pixels: Option<Vec<u8>>,
    pub moves: Vec<MoveRect>,
    pub dirty: Vec<Rect>,
    pub pointer: Option<ScriptedPointer>,
    pub shape: Option<(PointerShapeInfo, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Frame(ScriptedFrame),
    Timeout,
    Fail(CaptureError),
}

type Generator = Box<dyn FnMut(u64, &mut [u8], (u32, u32)) -> ScriptedFrame + Send>;

#[derive(Default)]
struct ScriptStats {
    acquires: AtomicUsize,
    frames: AtomicUsize,
    timeouts: AtomicUsize,
    releases: AtomicUsize,
    violations: AtomicUsize,
}

/// Counters describing how a scripted duplication was driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptCounts {
    pub acquires: usize,
    pub frames: usize,
    pub timeouts: usize,
    pub releases: usize,
    /// Acquire while holding a frame, or release without one.
    pub violations: usize,
}

/// Handle for reading a [`ScriptedDuplication`]'s counters after it moved into a session.
#[derive(Clone)]
pub struct ScriptProbe {
    stats: Arc<ScriptStats>,
}

impl ScriptProbe {
    pub fn counts(&self) -> ScriptCounts {
        ScriptCounts {
            acquires: self.stats.acquires.load(Ordering::Acquire),
            frames: self.stats.frames.load(Ordering::Acquire),
            timeouts: self.stats.timeouts.load(Ordering::Acquire),
            releases: self.stats.releases.load(Ordering::Acquire),
            violations: self.stats.violations.load(Ordering::Acquire),
        }
    }
}

struct ScriptState {
    surface_size: (u32, u32),
    surface: Vec<u8>,
    steps: VecDeque<ScriptStep>,
    generator: Option<Generator>,
    generated: u64,
    held: Option<ScriptedFrame>,
    present_time: i64,
    idle_wait: Duration,
}

impl ScriptState {
    fn next_step(&mut self) -> Option<ScriptStep> {
        if let Some(step) = self.steps.pop_front() {
            return Some(step);
        }

        let generator = self.generator.as_mut()?;
        let frame = generator(self.generated, &mut self.surface, self.surface_size);
        self.generated += 1;
        Some(ScriptStep::Frame(frame))
    }

    fn held(&self) -> Result<&ScriptedFrame> {
        self.held
            .as_ref()
            .ok_or_else(|| CaptureError::AcquisitionFailed("no frame is held".into()))
    }
}

/// Output duplication that plays back a list of steps.
///
/// Once the script runs out it behaves like an idle desktop and reports timeouts,
/// unless a generator was installed with [`synthetic_desktop`]. A device hands out
/// one claim on the script at a time; dropping the claim releases any held frame and
/// lets the output be duplicated again.
pub struct ScriptedDuplication {
    description: OutputDescription,
    state: Arc<Mutex<ScriptState>>,
    claimed: Arc<AtomicBool>,
    owner: bool,
    stats: Arc<ScriptStats>,
}

impl ScriptedDuplication {
    pub fn new(description: OutputDescription) -> Self {
        let surface_size = description.surface_size();
        Self {
            description,
            state: Arc::new(Mutex::new(ScriptState {
                surface: vec![0u8; surface_size.0 as usize * surface_size.1 as usize * 4],
                surface_size,
                steps: VecDeque::new(),
                generator: None,
                generated: 0,
                held: None,
                present_time: 0,
                idle_wait: Duration::from_millis(5),
            })),
            claimed: Arc::new(AtomicBool::new(false)),
            owner: false,
            stats: Arc::new(ScriptStats::default()),
        }
    }

    pub fn step(self, step: ScriptStep) -> Self {
        self.state.lock().steps.push_back(step);
        self
    }

    pub fn frame(self, frame: ScriptedFrame) -> Self {
        self.step(ScriptStep::Frame(frame))
    }

    /// Upper bound on how long a timeout step blocks.
    pub fn idle_wait(self, wait: Duration) -> Self {
        self.state.lock().idle_wait = wait;
        self
    }

    pub fn probe(&self) -> ScriptProbe {
        ScriptProbe { stats: self.stats.clone() }
    }

    /// Takes the exclusive claim on this output's script.
    pub(super) fn claim(&self) -> Result<ScriptedDuplication> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::SessionUnavailable);
        }

        Ok(ScriptedDuplication {
            description: self.description.clone(),
            state: self.state.clone(),
            claimed: self.claimed.clone(),
            owner: true,
            stats: self.stats.clone(),
        })
    }
}

impl Drop for ScriptedDuplication {
    fn drop(&mut self) {
        if self.owner {
            self.state.lock().held = None;
            self.claimed.store(false, Ordering::Release);
        }
    }
}

impl OutputDuplication for ScriptedDuplication {
    type Texture = SoftTexture;

    fn description(&self) -> &OutputDescription {
        &self.description
    }

    fn acquire_next_frame(&mut self, timeout_ms: u32) -> Result<(SoftTexture, FrameInfo)> {
        self.stats.acquires.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.lock();
        if state.held.is_some() {
            self.stats.violations.fetch_add(1, Ordering::AcqRel);
            return Err(CaptureError::AcquisitionFailed("previous frame was not released".into()));
        }

        let mut frame = match state.next_step() {
            Some(ScriptStep::Frame(frame)) => frame,
            Some(ScriptStep::Fail(e)) => return Err(e),
            Some(ScriptStep::Timeout) | None => {
                std::thread::sleep(state.idle_wait.min(Duration::from_millis(timeout_ms as u64)));
                self.stats.timeouts.fetch_add(1, Ordering::AcqRel);
                return Err(CaptureError::Timeout);
            }
        };

        if let Some(pixels) = frame.pixels.take() {
            state.surface = pixels;
        }
        state.present_time += 1;

        let (width, height) = state.surface_size;
        let texture = SoftTexture::from_pixels(width, height, TextureUsage::Default, state.surface.clone());
        let metadata_size = frame.moves.len() * MOVE_RECT_SIZE as usize + frame.dirty.len() * DIRTY_RECT_SIZE as usize;

        let info = FrameInfo {
            last_present_time: state.present_time,
            last_mouse_update_time: frame.pointer.map_or(0, |p| p.timestamp),
            accumulated_frames: 1,
            pointer: frame
                .pointer
                .map(|p| PointerPosition { position: p.position, visible: p.visible })
                .unwrap_or_default(),
            total_metadata_buffer_size: metadata_size as u32,
            pointer_shape_buffer_size: frame.shape.as_ref().map_or(0, |(_, data)| data.len() as u32),
        };

        state.held = Some(frame);
        self.stats.frames.fetch_add(1, Ordering::AcqRel);
        Ok((texture, info))
    }

    fn move_rects(&mut self, out: &mut [MoveRect]) -> Result<usize> {
        let state = self.state.lock();
        let moves = &state.held()?.moves;
        let count = moves.len().min(out.len());
        out[..count].copy_from_slice(&moves[..count]);
        Ok(count)
    }

    fn dirty_rects(&mut self, out: &mut [Rect]) -> Result<usize> {
        let state = self.state.lock();
        let dirty = &state.held()?.dirty;
        let count = dirty.len().min(out.len());
        out[..count].copy_from_slice(&dirty[..count]);
        Ok(count)
    }

    fn pointer_shape(&mut self, out: &mut [u8]) -> Result<PointerShapeInfo> {
        let state = self.state.lock();
        let Some((info, data)) = &state.held()?.shape else {
            return Ok(PointerShapeInfo::default());
        };
        if out.len() < data.len() {
            return Err(CaptureError::InvalidLength {
                requested: data.len(),
                available: out.len(),
            });
        }
        out[..data.len()].copy_from_slice(data);
        Ok(*info)
    }

    fn release_frame(&mut self) -> Result<()> {
        if self.state.lock().held.take().is_none() {
            self.stats.violations.fetch_add(1, Ordering::AcqRel);
            return Err(CaptureError::AcquisitionFailed("no frame to release".into()));
        }
        self.stats.releases.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

const BACKGROUND: [u8; 4] = [0x40, 0x30, 0x20, 0xff];
const BAR: [u8; 4] = [0x20, 0xc0, 0xf0, 0xff];

/// An output whose desktop shows a bar sweeping left to right, one step per frame,
/// with the dirty rectangles and pointer movement a real compositor would report.
pub fn synthetic_desktop(description: OutputDescription, frame_interval: Duration) -> ScriptedDuplication {
    let duplication = ScriptedDuplication::new(description).idle_wait(frame_interval);
    let bar_width = 32u32;

    duplication.state.lock().generator = Some(Box::new(move |index, surface, (width, height)| {
        if index > 0 {
            std::thread::sleep(frame_interval);
        }

        let span = width.saturating_sub(bar_width).max(1);
        let x = ((index * 8) % span as u64) as u32;
        let previous = if index == 0 { 0 } else { (((index - 1) * 8) % span as u64) as u32 };

        let dirty = if index == 0 {
            fill(surface, width, &Rect::from_size(width, height), BACKGROUND);
            Rect::from_size(width, height)
        } else {
            let old = Rect::new(previous as i32, 0, (previous + bar_width) as i32, height as i32);
            fill(surface, width, &old, BACKGROUND);
            old.union(&Rect::new(x as i32, 0, (x + bar_width) as i32, height as i32))
        };
        fill(surface, width, &Rect::new(x as i32, 0, (x + bar_width).min(width) as i32, height as i32), BAR);

        ScriptedFrame {
            pixels: None,
            moves: Vec::new(),
            dirty: vec![dirty],
            pointer: Some(ScriptedPointer {
                timestamp: index as i64 + 1,
                position: Point::new((x + bar_width / 2) as i32, (height / 2) as i32),
                visible: true,
            }),
            shape: None,
        }
    }));
    duplication
}

fn fill(surface: &mut [u8], width: u32, rect: &Rect, color: [u8; 4]) {
    let right = rect.right.min(width as i32);
    for y in rect.top.max(0)..rect.bottom {
        for x in rect.left.max(0)..right {
            let offset = (y as usize * width as usize + x as usize) * 4;
            if let Some(px) = surface.get_mut(offset..offset + 4) {
                px.copy_from_slice(&color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation;

    fn output(width: i32, height: i32) -> OutputDescription {
        OutputDescription {
            name: "SOFT1".into(),
            desktop_bounds: Rect::new(0, 0, width, height),
            rotation: Rotation::Identity,
            attached_to_desktop: true,
        }
    }

    #[test]
    fn test_metadata_size_matches_rects() {
        let mut dup = ScriptedDuplication::new(output(8, 8)).frame(ScriptedFrame {
            moves: vec![MoveRect::default()],
            dirty: vec![Rect::new(0, 0, 2, 2), Rect::new(4, 4, 8, 8)],
            ..Default::default()
        });

        let (_, info) = dup.acquire_next_frame(10).unwrap();
        assert_eq!(info.total_metadata_buffer_size, 24 + 2 * 16);
        let mut dirty = [Rect::default(); 4];
        assert_eq!(dup.dirty_rects(&mut dirty).unwrap(), 2);
        dup.release_frame().unwrap();
    }

    #[test]
    fn test_acquire_while_holding_is_a_violation() {
        let mut dup = ScriptedDuplication::new(output(4, 4))
            .frame(ScriptedFrame::default())
            .frame(ScriptedFrame::default());
        let probe = dup.probe();

        dup.acquire_next_frame(10).unwrap();
        assert!(dup.acquire_next_frame(10).is_err());
        assert_eq!(probe.counts().violations, 1);
    }

    #[test]
    fn test_exhausted_script_times_out() {
        let mut dup = ScriptedDuplication::new(output(4, 4)).idle_wait(Duration::ZERO);
        assert_eq!(dup.acquire_next_frame(100).unwrap_err(), CaptureError::Timeout);
        assert_eq!(dup.probe().counts().timeouts, 1);
    }

    #[test]
    fn test_synthetic_desktop_never_runs_dry() {
        let mut dup = synthetic_desktop(output(64, 16), Duration::ZERO);
        for _ in 0..5 {
            let (texture, info) = dup.acquire_next_frame(10).unwrap();
            assert!(info.total_metadata_buffer_size > 0);
            assert_eq!(texture.width(), 64);
            dup.release_frame().unwrap();
        }
    }
}
