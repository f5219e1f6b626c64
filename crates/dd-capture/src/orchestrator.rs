//! Multi-output capture into one desktop-sized shared surface.
//!
//! Every output gets a worker thread with its own device, duplication session and
//! compositor. Workers composite into a surface created by the orchestrator's device
//! and opened on theirs; compositing is serialized by the surface lock, which also
//! carries a generation counter so consumers can tell whether anything changed.

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::compositor::SurfaceCompositor;
use crate::frame::{Capture, FrameSource, FrameSourceDescriptor};
use crate::geometry::{OutputDescription, Point, Rect};
use crate::platform::{DeviceFactory, GpuDevice, create_device};
use crate::pointer::{PointerSnapshot, PointerTracker, PointerUpdate};
use crate::pool::PoolStats;
use crate::readback::FrameReadback;
use crate::session::{Acquired, CaptureSession};
use crate::{CaptureError, DEFAULT_POLL_TIMEOUT_MS, FrameTarget, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Restrict capture to one output. `None` captures every attached output.
    pub output: Option<u32>,
    pub poll_timeout_ms: u32,
    pub target: FrameTarget,
    pub fps: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output: None,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            target: FrameTarget::Cpu,
            fps: 30,
        }
    }
}

/// State shared between the orchestrator and its workers.
struct Shared {
    /// Held while compositing into or copying out of the shared surface. Counts
    /// completed composites.
    surface: Mutex<u64>,
    pointer: PointerTracker,
    stop: AtomicBool,
    failure: Mutex<Option<CaptureError>>,
}

impl Shared {
    fn fail(&self, output: u32, e: CaptureError) {
        error!("Worker for output {} failed: {}", output, e);
        self.failure.lock().get_or_insert(e);
        self.stop.store(true, Ordering::Release);
    }

    fn failure(&self) -> Option<CaptureError> {
        self.failure.lock().clone()
    }
}

struct WorkerContext<F: DeviceFactory> {
    factory: Arc<F>,
    output: u32,
    handle: <F::Device as GpuDevice>::SharedHandle,
    origin: Point,
    poll_timeout_ms: u32,
    shared: Arc<Shared>,
}

pub struct CaptureOrchestrator<F: DeviceFactory> {
    device: Arc<F::Device>,
    surface: <F::Device as GpuDevice>::Texture,
    bounds: Rect,
    outputs: Vec<OutputDescription>,
    shared: Arc<Shared>,
    workers: Vec<(u32, JoinHandle<()>)>,
    readback: FrameReadback<F::Device>,
    last_generation: u64,
    fps: u32,
}

impl<F: DeviceFactory> CaptureOrchestrator<F> {
    /// Creates the shared surface and starts one worker per output. Returns once every
    /// worker has its session running; if any fails to start, all are stopped.
    pub fn start(factory: Arc<F>, config: OrchestratorConfig) -> Result<Self> {
        let device = Arc::new(create_device(factory.as_ref())?);

        let outputs = match config.output {
            Some(output) => vec![(output, device.output_description(output)?)],
            None => {
                let mut outputs = Vec::new();
                for output in 0..device.output_count()? {
                    let description = device.output_description(output)?;
                    if description.attached_to_desktop {
                        outputs.push((output, description));
                    } else {
                        debug!("Skipping detached output {} ({})", output, description.name);
                    }
                }
                outputs
            }
        };

        let bounds = outputs
            .iter()
            .map(|(_, description)| description.desktop_bounds)
            .reduce(|a, b| a.union(&b))
            .ok_or(CaptureError::OutputNotFound(config.output.unwrap_or(0)))?;

        let (width, height) = (bounds.width() as u32, bounds.height() as u32);
        let (surface, handle) = device.create_shared_texture(width, height)?;
        let readback = FrameReadback::new(device.clone(), config.target, width, height)?;
        info!("Shared surface {}x{} at {:?} for {} outputs", width, height, bounds.origin(), outputs.len());

        let shared = Arc::new(Shared {
            surface: Mutex::new(0),
            pointer: PointerTracker::new(),
            stop: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        let mut orchestrator = Self {
            device,
            surface,
            bounds,
            outputs: outputs.iter().map(|(_, description)| description.clone()).collect(),
            shared: shared.clone(),
            workers: Vec::with_capacity(outputs.len()),
            readback,
            last_generation: 0,
            fps: config.fps,
        };

        let (ready_tx, ready_rx) = bounded(outputs.len());
        for (output, _) in &outputs {
            let context = WorkerContext {
                factory: factory.clone(),
                output: *output,
                handle: handle.clone(),
                origin: bounds.origin(),
                poll_timeout_ms: config.poll_timeout_ms,
                shared: shared.clone(),
            };
            let ready = ready_tx.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("dd-output-{}", output))
                .spawn(move || run_worker(context, ready));
            match spawned {
                Ok(handle) => orchestrator.workers.push((*output, handle)),
                Err(e) => {
                    let _ = orchestrator.stop();
                    return Err(CaptureError::AcquisitionFailed(format!("failed to spawn worker: {}", e)));
                }
            }
        }
        drop(ready_tx);

        for _ in 0..orchestrator.workers.len() {
            let (output, result) = ready_rx
                .recv()
                .map_err(|_| CaptureError::AcquisitionFailed("worker exited during startup".into()))?;
            if let Err(e) = result {
                error!("Output {} failed to start: {}", output, e);
                let _ = orchestrator.stop();
                return Err(e);
            }
        }

        info!("Capture orchestrator running with {} workers", orchestrator.workers.len());
        Ok(orchestrator)
    }

    /// Desktop rectangle covered by the shared surface.
    pub fn desktop_bounds(&self) -> Rect {
        self.bounds
    }

    pub fn outputs(&self) -> &[OutputDescription] {
        &self.outputs
    }

    pub fn pointer(&self) -> PointerSnapshot {
        self.shared.pointer.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.readback.stats()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.load(Ordering::Acquire)
    }

    /// Signals every worker and waits for all of them to exit. Shutdown takes at most
    /// one poll timeout. Reports the first worker failure, if any.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.stop.store(true, Ordering::Release);
        for (output, worker) in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Worker for output {} panicked", output);
            }
        }

        match self.shared.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<F: DeviceFactory> FrameSource for CaptureOrchestrator<F> {
    type Device = F::Device;

    fn descriptor(&self) -> FrameSourceDescriptor {
        let (width, height) = self.readback.size();
        FrameSourceDescriptor { width, height, frame_rate: self.fps }
    }

    /// Copies the shared surface if any worker composited since the last call, otherwise
    /// returns [`Capture::Repeat`]. Pointer-only updates do not touch the surface and so
    /// also yield `Repeat`; the pointer is read separately through [`Self::pointer`].
    fn capture(&mut self) -> Result<Capture<F::Device>> {
        if let Some(e) = self.shared.failure() {
            return Err(e);
        }

        let staged = {
            let generation = self.shared.surface.lock();
            if *generation == self.last_generation {
                return Ok(Capture::Repeat);
            }

            self.device.lock_shared(&self.surface)?;
            let region = Rect::from_size(self.bounds.width() as u32, self.bounds.height() as u32);
            let staged = self.readback.stage(&self.surface, &region);
            self.device.unlock_shared(&self.surface);
            self.last_generation = *generation;
            staged?
        };

        Ok(Capture::Frame(self.readback.finish(staged)?))
    }
}

impl<F: DeviceFactory> Drop for CaptureOrchestrator<F> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.stop();
        }
        info!("Capture orchestrator stopped");
    }
}

type Ready = crossbeam_channel::Sender<(u32, Result<()>)>;

fn run_worker<F: DeviceFactory>(context: WorkerContext<F>, ready: Ready) {
    let output = context.output;
    let (session, compositor) = match open_worker(&context) {
        Ok(opened) => {
            let _ = ready.send((output, Ok(())));
            opened
        }
        Err(e) => {
            let _ = ready.send((output, Err(e)));
            return;
        }
    };
    drop(ready);

    info!("Worker for output {} running", output);
    if let Err(e) = worker_loop(&context, session, compositor) {
        context.shared.fail(output, e);
    }
    info!("Worker for output {} exiting", output);
}

type Opened<D> = (CaptureSession<<D as GpuDevice>::Texture>, SurfaceCompositor<D>);

fn open_worker<F: DeviceFactory>(context: &WorkerContext<F>) -> Result<Opened<F::Device>> {
    let device = Arc::new(create_device(context.factory.as_ref())?);
    let description = device.output_description(context.output)?;
    let target = device.open_shared_texture(&context.handle)?;
    let duplication = device.duplicate_output(context.output)?;
    let session = CaptureSession::start(context.output, duplication)?;
    let compositor = SurfaceCompositor::new(device, target, context.origin, description);
    Ok((session, compositor))
}

fn worker_loop<F: DeviceFactory>(
    context: &WorkerContext<F>,
    mut session: CaptureSession<<F::Device as GpuDevice>::Texture>,
    mut compositor: SurfaceCompositor<F::Device>,
) -> Result<()> {
    let shared = &context.shared;
    let bounds = compositor.description().desktop_bounds;

    while !shared.stop.load(Ordering::Acquire) {
        let frame = match session.try_acquire(context.poll_timeout_ms)? {
            Acquired::Timeout => continue,
            Acquired::Frame(frame) => frame,
        };

        let composited = {
            let mut generation = shared.surface.lock();
            let result = compositor.process(&frame.surface, &frame.info, &frame.metadata);
            if result.is_ok() && !frame.metadata.is_empty() {
                *generation += 1;
            }
            result
        };

        shared
            .pointer
            .merge(&PointerUpdate::from_frame(&frame), context.output, &bounds, context.origin);

        session.release(frame)?;
        composited?;
        session.begin_acquire(context.poll_timeout_ms)?;
    }

    Ok(())
}
