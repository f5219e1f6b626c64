use crate::{config::EngineConfig, error::Result, types::*, EngineError};
use dd_capture::{Capture, CaptureError, Frame, FrameSource, GpuDevice};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

enum Captured<D: GpuDevice> {
    Frame(FrameStamp, Frame<D>),
    Repeat(FrameStamp),
}

/// Paces a [`FrameSource`] on a blocking thread and hands its output to a
/// [`FrameSink`] on the runtime.
pub struct CaptureEngine<S, K>
where
    S: FrameSource + 'static,
    K: FrameSink<S::Device>,
{
    config: EngineConfig,
    running: Arc<RwLock<bool>>,

    // Parked here between runs
    source: Option<S>,
    sink: Option<K>,

    capture_task: Option<JoinHandle<(S, Option<CaptureError>)>>,
    dispatch_task: Option<JoinHandle<(K, Option<EngineError>)>>,
    failure: Option<EngineError>,

    // Shutdown signal
    shutdown_tx: broadcast::Sender<()>,

    // Statistics
    stats: Arc<RwLock<EngineStats>>,
}

impl<S, K> CaptureEngine<S, K>
where
    S: FrameSource + 'static,
    K: FrameSink<S::Device>,
{
    pub fn new(source: S, sink: K, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!("Created capture engine with config: {:?}", config);

        Ok(Self {
            config,
            running: Arc::new(RwLock::new(false)),
            source: Some(source),
            sink: Some(sink),
            capture_task: None,
            dispatch_task: None,
            failure: None,
            shutdown_tx,
            stats: Arc::new(RwLock::new(EngineStats::default())),
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(EngineError::AlreadyRunning);
        }

        let source = self
            .source
            .take()
            .ok_or_else(|| EngineError::Config("frame source was lost by a failed run".into()))?;
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => {
                self.source = Some(source);
                return Err(EngineError::Config("frame sink was lost by a failed run".into()));
            }
        };

        let descriptor = source.descriptor();
        let frame_rate = self.config.frame_rate.unwrap_or(descriptor.frame_rate).max(1);
        info!(
            "Starting capture engine: {}x{} at {} fps",
            descriptor.width, descriptor.height, frame_rate
        );

        *self.stats.write().await = EngineStats::default();
        self.failure = None;

        let (frame_tx, frame_rx) = mpsc::channel(self.config.frame_channel_capacity);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let pacing = Pacing {
            interval: Duration::from_secs_f64(1.0 / frame_rate as f64),
            forward_repeats: self.config.forward_repeats,
        };

        let stats = self.stats.clone();
        self.capture_task = Some(tokio::task::spawn_blocking(move || {
            capture_loop(source, pacing, frame_tx, shutdown_rx, stats)
        }));
        self.dispatch_task = Some(tokio::spawn(dispatch_loop(sink, frame_rx, self.stats.clone())));

        *running = true;
        info!("Capture engine started");
        Ok(())
    }

    /// Signals the capture thread and waits for both loops to drain.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running().await {
            return Err(EngineError::NotRunning);
        }

        info!("Stopping capture engine");
        let _ = self.shutdown_tx.send(());
        self.join().await
    }

    /// Waits for the run to end on its own, which happens on a capture or sink error.
    pub async fn wait(&mut self) -> Result<()> {
        if !self.is_running().await {
            return Err(EngineError::NotRunning);
        }
        self.join().await
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn get_stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// The source, while the engine is stopped.
    pub fn source(&self) -> Option<&S> {
        self.source.as_ref()
    }

    /// The sink, while the engine is stopped.
    pub fn sink(&self) -> Option<&K> {
        self.sink.as_ref()
    }

    // Handles are only cleared once joined, so a cancelled wait can be resumed.
    async fn join(&mut self) -> Result<()> {
        if let Some(task) = self.capture_task.as_mut() {
            let joined = task.await;
            self.capture_task = None;
            match joined {
                Ok((source, error)) => {
                    self.source = Some(source);
                    if let Some(e) = error {
                        self.failure.get_or_insert(e.into());
                    }
                }
                Err(e) => {
                    self.failure.get_or_insert(e.into());
                }
            }
        }

        if let Some(task) = self.dispatch_task.as_mut() {
            let joined = task.await;
            self.dispatch_task = None;
            match joined {
                Ok((sink, error)) => {
                    self.sink = Some(sink);
                    if let Some(e) = error {
                        self.failure.get_or_insert(e);
                    }
                }
                Err(e) => {
                    self.failure.get_or_insert(e.into());
                }
            }
        }

        *self.running.write().await = false;
        info!("Capture engine stopped");

        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pacing {
    interval: Duration,
    forward_repeats: bool,
}

fn capture_loop<S: FrameSource>(
    mut source: S,
    pacing: Pacing,
    frame_tx: mpsc::Sender<Captured<S::Device>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<RwLock<EngineStats>>,
) -> (S, Option<CaptureError>) {
    info!("Capture loop started");

    let started = Instant::now();
    let mut next = started;
    let mut sequence = 0u64;

    loop {
        match shutdown_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => {
                info!("Capture loop shutting down");
                break;
            }
        }

        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            // Fell behind; do not try to catch up with a burst.
            next = now;
        }
        next += pacing.interval;

        let began = Instant::now();
        let result = source.capture();
        let stamp = FrameStamp { sequence, elapsed: started.elapsed() };
        sequence += 1;

        let message = {
            let mut s = stats.blocking_write();
            match result {
                Ok(Capture::Frame(frame)) => {
                    s.frames_captured += 1;
                    s.record_capture_time(began.elapsed());
                    Captured::Frame(stamp, frame)
                }
                Ok(Capture::Repeat) => {
                    s.repeats += 1;
                    s.record_capture_time(began.elapsed());
                    if !pacing.forward_repeats {
                        continue;
                    }
                    Captured::Repeat(stamp)
                }
                Err(e) => {
                    s.capture_errors += 1;
                    error!("Capture failed: {}", e);
                    return (source, Some(e));
                }
            }
        };

        match frame_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Sink is behind, dropping frame {}", stamp.sequence);
                stats.blocking_write().frames_dropped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                error!("Frame channel closed");
                break;
            }
        }
    }

    (source, None)
}

async fn dispatch_loop<D, K>(
    mut sink: K,
    mut frame_rx: mpsc::Receiver<Captured<D>>,
    stats: Arc<RwLock<EngineStats>>,
) -> (K, Option<EngineError>)
where
    D: GpuDevice,
    K: FrameSink<D>,
{
    info!("Dispatch loop started");

    // Ends once the capture loop drops its sender, after every queued frame is written.
    while let Some(message) = frame_rx.recv().await {
        let result = match message {
            Captured::Frame(stamp, frame) => {
                let bytes = (frame.stride() * frame.height() as usize) as u64;
                sink.write_frame(stamp, frame).map(|()| Some(bytes))
            }
            Captured::Repeat(stamp) => sink.write_repeat(stamp).map(|()| None),
        };

        match result {
            Ok(Some(bytes)) => {
                let mut s = stats.write().await;
                s.frames_delivered += 1;
                s.bytes_delivered += bytes;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Sink failed: {}", e);
                return (sink, Some(e));
            }
        }
    }

    let finished = sink.finish().err();
    info!("Dispatch loop finished");
    (sink, finished)
}
