//! One duplication handle driven from a background acquisition thread.
//!
//! The caller talks to the thread through a request/response pair of channels. At most
//! one acquisition is in flight, and a frame's platform resource is released before the
//! next acquisition is issued: requests are handled in order, so a `Release` sent before
//! an `Acquire` always completes first.

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::geometry::OutputDescription;
use crate::metadata::FrameMetadata;
use crate::platform::{FrameInfo, OutputDuplication, PointerShapeInfo};
use crate::{CaptureError, Result};

/// A desktop image held by the platform until it is handed back with
/// [`CaptureSession::release`].
pub struct DuplicatedFrame<T> {
    pub surface: T,
    pub info: FrameInfo,
    pub metadata: FrameMetadata,
    /// Shape bytes; only the first `info.pointer_shape_buffer_size` are valid.
    pub pointer_shape: Vec<u8>,
    /// Present when this frame carried a new pointer shape.
    pub pointer_shape_info: Option<PointerShapeInfo>,
}

impl<T> DuplicatedFrame<T> {
    pub fn pointer_shape_bytes(&self) -> &[u8] {
        let len = (self.info.pointer_shape_buffer_size as usize).min(self.pointer_shape.len());
        &self.pointer_shape[..len]
    }
}

pub enum Acquired<T> {
    Frame(DuplicatedFrame<T>),
    /// The desktop did not change within the timeout.
    Timeout,
}

enum Request {
    Acquire { timeout_ms: u32 },
    Release { metadata: FrameMetadata, pointer_shape: Vec<u8> },
    Shutdown,
}

enum Response<T> {
    Frame(DuplicatedFrame<T>),
    Timeout,
    Failed(CaptureError),
}

pub struct CaptureSession<T: Send + 'static> {
    output: u32,
    description: OutputDescription,
    requests: Sender<Request>,
    responses: Receiver<Response<T>>,
    in_flight: bool,
    held: bool,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> CaptureSession<T> {
    /// Moves `duplication` onto its own acquisition thread.
    pub fn start<P>(output: u32, duplication: P) -> Result<Self>
    where
        P: OutputDuplication<Texture = T>,
    {
        let description = duplication.description().clone();
        let (requests, request_rx) = unbounded();
        let (response_tx, responses) = bounded(1);

        let worker = std::thread::Builder::new()
            .name(format!("dd-acquire-{}", output))
            .spawn(move || acquisition_loop(output, duplication, request_rx, response_tx))
            .map_err(|e| CaptureError::AcquisitionFailed(format!("failed to spawn acquisition thread: {}", e)))?;

        info!("Capture session started for output {} ({})", output, description.name);
        Ok(Self {
            output,
            description,
            requests,
            responses,
            in_flight: false,
            held: false,
            worker: Some(worker),
        })
    }

    pub fn output(&self) -> u32 {
        self.output
    }

    pub fn description(&self) -> &OutputDescription {
        &self.description
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Issues an acquisition unless one is already pending. Returns whether a new one was issued.
    pub fn begin_acquire(&mut self, timeout_ms: u32) -> Result<bool> {
        if self.in_flight {
            return Ok(false);
        }
        if self.held {
            return Err(CaptureError::AcquisitionFailed("previous frame was not released".into()));
        }

        self.send(Request::Acquire { timeout_ms })?;
        self.in_flight = true;
        Ok(true)
    }

    /// Non-blocking check for the pending acquisition's result.
    pub fn poll(&mut self) -> Result<Option<Acquired<T>>> {
        if !self.in_flight {
            return Ok(None);
        }

        match self.responses.try_recv() {
            Ok(response) => self.complete(response).map(Some),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                self.in_flight = false;
                Err(worker_gone())
            }
        }
    }

    /// Blocks until the pending acquisition completes.
    pub fn wait(&mut self) -> Result<Acquired<T>> {
        if !self.in_flight {
            return Err(CaptureError::AcquisitionFailed("no acquisition in flight".into()));
        }

        match self.responses.recv() {
            Ok(response) => self.complete(response),
            Err(_) => {
                self.in_flight = false;
                Err(worker_gone())
            }
        }
    }

    /// Issues an acquisition if none is pending and waits for it.
    pub fn try_acquire(&mut self, timeout_ms: u32) -> Result<Acquired<T>> {
        self.begin_acquire(timeout_ms)?;
        self.wait()
    }

    /// Hands the frame back so the platform can reuse it. Its metadata and shape
    /// buffers return to the acquisition thread for the next frame.
    pub fn release(&mut self, frame: DuplicatedFrame<T>) -> Result<()> {
        let DuplicatedFrame { surface, metadata, pointer_shape, .. } = frame;
        drop(surface);
        self.held = false;
        self.send(Request::Release { metadata, pointer_shape })
    }

    fn complete(&mut self, response: Response<T>) -> Result<Acquired<T>> {
        self.in_flight = false;
        match response {
            Response::Frame(frame) => {
                self.held = true;
                Ok(Acquired::Frame(frame))
            }
            Response::Timeout => Ok(Acquired::Timeout),
            Response::Failed(e) => Err(e),
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests.send(request).map_err(|_| worker_gone())
    }
}

impl<T: Send + 'static> Drop for CaptureSession<T> {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Acquisition thread for output {} panicked", self.output);
            }
        }
        info!("Capture session stopped for output {}", self.output);
    }
}

fn worker_gone() -> CaptureError {
    CaptureError::AcquisitionFailed("acquisition thread exited".into())
}

fn acquisition_loop<P: OutputDuplication>(
    output: u32,
    mut duplication: P,
    requests: Receiver<Request>,
    responses: Sender<Response<P::Texture>>,
) {
    let mut holding = false;
    let mut deferred: Option<CaptureError> = None;
    let mut metadata = FrameMetadata::default();
    let mut pointer_shape = Vec::new();

    while let Ok(request) = requests.recv() {
        match request {
            Request::Acquire { timeout_ms } => {
                if holding {
                    holding = false;
                    if let Err(e) = duplication.release_frame() {
                        deferred.get_or_insert(e);
                    }
                }

                let response = match deferred.take() {
                    Some(e) => Response::Failed(e),
                    None => acquire(
                        &mut duplication,
                        timeout_ms,
                        &mut holding,
                        &mut metadata,
                        &mut pointer_shape,
                    ),
                };

                if responses.send(response).is_err() {
                    break;
                }
            }
            Request::Release { metadata: returned, pointer_shape: shape } => {
                metadata = returned;
                pointer_shape = shape;
                if holding {
                    holding = false;
                    if let Err(e) = duplication.release_frame() {
                        warn!("Output {} frame release failed: {}", output, e);
                        deferred.get_or_insert(e);
                    }
                }
            }
            Request::Shutdown => break,
        }
    }

    if holding {
        let _ = duplication.release_frame();
    }
    debug!("Acquisition thread for output {} exiting", output);
}

fn acquire<P: OutputDuplication>(
    duplication: &mut P,
    timeout_ms: u32,
    holding: &mut bool,
    metadata: &mut FrameMetadata,
    pointer_shape: &mut Vec<u8>,
) -> Response<P::Texture> {
    let (surface, info) = match duplication.acquire_next_frame(timeout_ms) {
        Ok(frame) => frame,
        Err(CaptureError::Timeout) => return Response::Timeout,
        Err(e) => return Response::Failed(e),
    };
    *holding = true;

    let extracted = metadata
        .fill(duplication, info.total_metadata_buffer_size)
        .and_then(|_| read_pointer_shape(duplication, &info, pointer_shape));

    match extracted {
        // The buffers travel with the frame and come back on release; on a timeout or
        // failure they stay here.
        Ok(pointer_shape_info) => Response::Frame(DuplicatedFrame {
            surface,
            info,
            metadata: std::mem::take(metadata),
            pointer_shape: std::mem::take(pointer_shape),
            pointer_shape_info,
        }),
        Err(e) => {
            *holding = false;
            let _ = duplication.release_frame();
            Response::Failed(e)
        }
    }
}

fn read_pointer_shape<P: OutputDuplication>(
    duplication: &mut P,
    info: &FrameInfo,
    buffer: &mut Vec<u8>,
) -> Result<Option<PointerShapeInfo>> {
    let size = info.pointer_shape_buffer_size as usize;
    if size == 0 {
        return Ok(None);
    }
    if buffer.len() < size {
        buffer.resize(size, 0);
    }
    duplication.pointer_shape(&mut buffer[..size]).map(Some)
}
