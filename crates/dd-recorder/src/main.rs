use clap::Parser;
use dd_capture::platform::create_device;
use dd_capture::soft::{SoftDeviceFactory, synthetic_desktop};
use dd_capture::{
    CaptureMode, DeviceFactory, FrameSource, FrameTarget, GpuDevice, OutputDescription, Rect, Rotation,
    ScreenCaptureManager,
};
use dd_core::CaptureEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod metrics;
mod report;
mod sink;

use config::{Backend, Config, LoggingConfig};
use report::{PointerReport, RunReport};
use sink::CountingSink;

const SYNTHETIC_WIDTH: i32 = 640;
const SYNTHETIC_HEIGHT: i32 = 360;

#[derive(Parser, Debug)]
#[command(name = "dd-recorder")]
#[command(about = "Captures the desktop through desktop duplication", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "recorder.toml")]
    config: PathBuf,

    /// Monitor index to capture (overrides config)
    #[arg(short, long)]
    monitor: Option<u32>,

    /// Composite every monitor into one desktop-sized frame
    #[arg(short, long)]
    desktop: bool,

    /// Keep frames on the GPU instead of reading them back
    #[arg(long)]
    gpu: bool,

    /// Capture rate (overrides config)
    #[arg(long)]
    fps: Option<u32>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Write a JSON run report here on exit
    #[arg(long)]
    report: Option<PathBuf>,

    /// Use the synthetic backend even where duplication is available
    #[arg(long)]
    synthetic: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List available outputs and exit
    #[arg(long)]
    list_outputs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (mut config, loaded) = if args.config.exists() {
        (Config::from_file(&args.config)?, true)
    } else {
        (Config::default(), false)
    };
    apply_overrides(&mut config, &args);
    init_logging(args.verbose, &config.logging);

    info!("Desktop Recorder v{}", env!("CARGO_PKG_VERSION"));
    if loaded {
        info!("Loaded configuration from: {}", args.config.display());
    } else {
        warn!("Config file {} not found, using defaults", args.config.display());
    }

    config.validate()?;

    match resolve_backend(config.backend) {
        Backend::Win32 => run_win32(config, args.list_outputs).await,
        _ => {
            let factory = Arc::new(synthetic_factory(&config));
            if args.list_outputs {
                return list_outputs(factory.as_ref());
            }
            run(factory, config, "synthetic").await
        }
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if args.desktop {
        config.capture.mode = CaptureMode::Desktop { output: args.monitor };
    } else if let Some(monitor) = args.monitor {
        config.capture.mode = match config.capture.mode {
            CaptureMode::Single { region, .. } => CaptureMode::Single { output: monitor, region },
            CaptureMode::Desktop { .. } => CaptureMode::Desktop { output: Some(monitor) },
        };
    }

    if args.gpu {
        config.capture.target = FrameTarget::Gpu;
    }
    if let Some(fps) = args.fps {
        config.capture.fps = fps;
    }
    if args.duration.is_some() {
        config.recorder.duration_secs = args.duration;
    }
    if args.report.is_some() {
        config.recorder.report = args.report.clone();
    }
    if args.synthetic {
        config.backend = Backend::Synthetic;
    }
    if args.json {
        config.logging.json = true;
    }
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_backend(backend: Backend) -> Backend {
    match backend {
        Backend::Auto if cfg!(windows) => Backend::Win32,
        Backend::Auto => Backend::Synthetic,
        other => other,
    }
}

#[cfg(windows)]
async fn run_win32(config: Config, list: bool) -> anyhow::Result<()> {
    let factory = Arc::new(dd_capture::win32::D3D11Factory::new()?);
    if list {
        return list_outputs(factory.as_ref());
    }
    run(factory, config, "win32").await
}

#[cfg(not(windows))]
async fn run_win32(_config: Config, _list: bool) -> anyhow::Result<()> {
    anyhow::bail!("Desktop duplication is only available on Windows")
}

/// Monitors laid out left to right, each showing a moving bar.
fn synthetic_factory(config: &Config) -> SoftDeviceFactory {
    let interval = Duration::from_secs_f64(1.0 / config.capture.fps.max(1) as f64);
    let outputs = (0..config.recorder.synthetic_outputs as i32)
        .map(|i| {
            synthetic_desktop(
                OutputDescription {
                    name: format!("SYNTH{}", i + 1),
                    desktop_bounds: Rect::new(i * SYNTHETIC_WIDTH, 0, (i + 1) * SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT),
                    rotation: Rotation::Identity,
                    attached_to_desktop: true,
                },
                interval,
            )
        })
        .collect();
    SoftDeviceFactory::new(outputs)
}

fn list_outputs<F: DeviceFactory>(factory: &F) -> anyhow::Result<()> {
    let device = create_device(factory)?;
    println!("Available outputs:");
    for output in 0..device.output_count()? {
        let description = device.output_description(output)?;
        let bounds = description.desktop_bounds;
        println!(
            "  {}. {} {}x{} at ({}, {}) {:?}{}",
            output,
            description.name,
            bounds.width(),
            bounds.height(),
            bounds.left,
            bounds.top,
            description.rotation,
            if description.attached_to_desktop { "" } else { " (detached)" },
        );
    }
    Ok(())
}

async fn run<F: DeviceFactory>(factory: Arc<F>, config: Config, backend: &str) -> anyhow::Result<()> {
    let manager = ScreenCaptureManager::new(factory, &config.capture)?;
    let descriptor = manager.descriptor();

    info!("Configuration:");
    info!("  Backend: {}", backend);
    info!("  Capture: {}", config.describe_mode());
    info!(
        "  Frames: {}x{} @ {} fps, {:?}",
        descriptor.width, descriptor.height, descriptor.frame_rate, config.capture.target
    );

    let mut engine = CaptureEngine::new(manager, CountingSink::new(), config.engine.clone())?;
    engine.start().await?;

    let limit = config.recorder.duration_secs.map(Duration::from_secs);
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down...");
            engine.stop().await
        }
        _ = sleep_for(limit) => {
            info!("Recording time limit reached");
            engine.stop().await
        }
        result = engine.wait() => result,
    };

    let mut report = RunReport::new(&config.recorder.name, backend, config.describe_mode(), descriptor);
    report.engine = engine.get_stats().await;
    if let Some(manager) = engine.source() {
        report.pool = Some(manager.pool_stats());
        report.pointer = manager.pointer().as_ref().map(PointerReport::from);
    }
    if let Some(sink) = engine.sink() {
        report.output = sink.metrics().snapshot();
    }
    if let Err(e) = &outcome {
        report.error = Some(e.to_string());
    }

    info!(
        "Captured {} frames ({} repeats, {} dropped), average capture {:.2} ms",
        report.engine.frames_captured,
        report.engine.repeats,
        report.engine.frames_dropped,
        report.engine.average_capture_time_ms
    );
    info!(
        "Sink received {} frames at {:.1} fps, {:.1} Mbit/s",
        report.output.frames_written, report.output.average_fps, report.output.average_throughput_mbps
    );

    if let Some(path) = &config.recorder.report {
        report.write(path)?;
        info!("Report written to {}", path.display());
    }

    outcome?;
    info!("Recorder stopped gracefully");
    Ok(())
}

async fn sleep_for(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}
