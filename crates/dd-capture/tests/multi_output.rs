mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{capture_until, output, pixel, script, solid};
use dd_capture::soft::{ScriptStep, ScriptedDuplication, ScriptedFrame, ScriptedPointer, SoftDeviceFactory};
use dd_capture::{
    CaptureError, CaptureOrchestrator, DeviceFactory, DriverType, FrameSource, FrameTarget, GpuDevice,
    OrchestratorConfig, Point, Rect, Rotation,
};

const LEFT: Rect = Rect::new(-8, 0, 0, 4);
const RIGHT: Rect = Rect::new(0, 0, 8, 4);
const RED: [u8; 4] = [0, 0, 255, 255];
const BLUE: [u8; 4] = [255, 0, 0, 255];

fn full_update(color: [u8; 4], pointer: Option<ScriptedPointer>) -> ScriptedFrame {
    ScriptedFrame {
        pixels: Some(solid(8, 4, color)),
        dirty: vec![Rect::new(0, 0, 8, 4)],
        pointer,
        ..Default::default()
    }
}

fn config(target: FrameTarget) -> OrchestratorConfig {
    OrchestratorConfig {
        poll_timeout_ms: 50,
        target,
        ..Default::default()
    }
}

#[test]
fn test_outputs_composite_side_by_side() {
    let factory = Arc::new(SoftDeviceFactory::new(vec![
        script("LEFT", LEFT).frame(full_update(RED, None)),
        script("RIGHT", RIGHT).frame(full_update(BLUE, None)),
    ]));
    let mut orchestrator = CaptureOrchestrator::start(factory, config(FrameTarget::Cpu)).unwrap();

    assert_eq!(orchestrator.desktop_bounds(), Rect::new(-8, 0, 8, 4));
    let descriptor = orchestrator.descriptor();
    assert_eq!((descriptor.width, descriptor.height), (16, 4));

    let data = capture_until(&mut orchestrator, Duration::from_secs(5), |data| {
        pixel(data, 16, 0, 0) == RED && pixel(data, 16, 15, 3) == BLUE
    });
    assert_eq!(pixel(&data, 16, 7, 2), RED);
    assert_eq!(pixel(&data, 16, 8, 2), BLUE);

    // Nothing changes afterwards, so the surface is not copied again.
    std::thread::sleep(Duration::from_millis(100));
    assert!(orchestrator.capture().unwrap().is_repeat());
    orchestrator.stop().unwrap();
}

#[test]
fn test_gpu_frames_from_shared_surface() {
    let factory = Arc::new(SoftDeviceFactory::new(vec![script("RIGHT", RIGHT).frame(full_update(BLUE, None))]));
    let mut orchestrator = CaptureOrchestrator::start(factory, config(FrameTarget::Gpu)).unwrap();

    let data = capture_until(&mut orchestrator, Duration::from_secs(5), |data| pixel(data, 8, 0, 0) == BLUE);
    assert_eq!(data, solid(8, 4, BLUE));
    assert_eq!(orchestrator.pool_stats().outstanding, 0);
}

#[test]
fn test_rotated_output_is_composited_upright() {
    // Portrait output: 2 wide and 4 tall on the desktop, duplicated as a 4x2 surface.
    let surface: Vec<u8> = (0..8u8).flat_map(|i| [i, 0, 0, 255]).collect();
    let dup = ScriptedDuplication::new(output("PORTRAIT", Rect::new(0, 0, 2, 4), Rotation::Rotate90))
        .idle_wait(Duration::from_millis(2))
        .frame(ScriptedFrame {
            pixels: Some(surface),
            dirty: vec![Rect::new(0, 0, 4, 2)],
            ..Default::default()
        });
    let factory = Arc::new(SoftDeviceFactory::new(vec![dup]));
    let mut orchestrator = CaptureOrchestrator::start(factory, config(FrameTarget::Cpu)).unwrap();

    let data = capture_until(&mut orchestrator, Duration::from_secs(5), |data| data.chunks(4).any(|px| px[3] == 255));
    for y in 0..4u32 {
        for x in 0..2u32 {
            // Desktop (x, y) shows surface pixel (y, 1 - x).
            let expected = ((1 - x) * 4 + y) as u8;
            assert_eq!(pixel(&data, 2, x, y)[0], expected, "desktop pixel ({}, {})", x, y);
        }
    }
}

#[test]
fn test_pointer_merged_across_outputs() {
    let left = script("LEFT", LEFT).frame(full_update(
        RED,
        Some(ScriptedPointer { timestamp: 10, position: Point::new(3, 1), visible: true }),
    ));
    let right = script("RIGHT", RIGHT)
        .step(ScriptStep::Timeout)
        .step(ScriptStep::Timeout)
        .frame(full_update(
            BLUE,
            Some(ScriptedPointer { timestamp: 20, position: Point::new(5, 2), visible: true }),
        ));
    let factory = Arc::new(SoftDeviceFactory::new(vec![left, right]));
    let orchestrator = CaptureOrchestrator::start(factory, config(FrameTarget::Cpu)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while orchestrator.pointer().timestamp < 20 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let pointer = orchestrator.pointer();
    assert_eq!(pointer.timestamp, 20);
    assert_eq!(pointer.last_writer, Some(1));
    assert_eq!(pointer.position, Point::new(13, 2));
    assert!(pointer.visible);
}

#[test]
fn test_pointer_only_update_repeats_frame() {
    let right = script("RIGHT", RIGHT).frame(full_update(BLUE, None)).frame(ScriptedFrame {
        pointer: Some(ScriptedPointer { timestamp: 30, position: Point::new(6, 1), visible: true }),
        ..Default::default()
    });
    let factory = Arc::new(SoftDeviceFactory::new(vec![right]));
    let mut orchestrator = CaptureOrchestrator::start(factory, config(FrameTarget::Cpu)).unwrap();

    capture_until(&mut orchestrator, Duration::from_secs(5), |data| pixel(data, 8, 0, 0) == BLUE);

    let deadline = Instant::now() + Duration::from_secs(5);
    while orchestrator.pointer().timestamp < 30 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(orchestrator.pointer().position, Point::new(6, 1));
    assert!(orchestrator.capture().unwrap().is_repeat());
    orchestrator.stop().unwrap();
}

#[test]
fn test_single_output_restriction() {
    let factory = Arc::new(SoftDeviceFactory::new(vec![script("LEFT", LEFT), script("RIGHT", RIGHT)]));
    let orchestrator = CaptureOrchestrator::start(
        factory,
        OrchestratorConfig { output: Some(1), ..config(FrameTarget::Cpu) },
    )
    .unwrap();

    assert_eq!(orchestrator.outputs().len(), 1);
    assert_eq!(orchestrator.desktop_bounds(), RIGHT);
}

#[test]
fn test_startup_failure_stops_all_workers() {
    let left = script("LEFT", LEFT);
    let probe = left.probe();
    let factory = Arc::new(SoftDeviceFactory::new(vec![left, script("RIGHT", RIGHT)]));

    // Another client already holds the right output.
    let other = factory.create(DriverType::Hardware).unwrap();
    let _held = other.duplicate_output(1).unwrap();

    let result = CaptureOrchestrator::start(factory.clone(), config(FrameTarget::Cpu));
    assert!(matches!(result, Err(CaptureError::SessionUnavailable)));

    // The left worker was shut down, so its output can be duplicated again.
    let acquires = probe.counts().acquires;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.counts().acquires, acquires);
    assert!(other.duplicate_output(0).is_ok());
}

#[test]
fn test_device_creation_failure_is_fatal() {
    let factory = Arc::new(
        SoftDeviceFactory::new(vec![script("RIGHT", RIGHT)]).failing_drivers(&[
            DriverType::Hardware,
            DriverType::Warp,
            DriverType::Reference,
        ]),
    );
    let result = CaptureOrchestrator::start(factory, config(FrameTarget::Cpu));
    assert!(matches!(result, Err(CaptureError::DeviceCreationFailed)));
}

#[test]
fn test_worker_failure_is_reported() {
    let failing = script("RIGHT", RIGHT)
        .frame(full_update(BLUE, None))
        .step(ScriptStep::Fail(CaptureError::AcquisitionFailed("access lost".into())));
    let factory = Arc::new(SoftDeviceFactory::new(vec![script("LEFT", LEFT), failing]));
    let mut orchestrator = CaptureOrchestrator::start(factory, config(FrameTarget::Cpu)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while orchestrator.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(!orchestrator.is_running());
    assert!(matches!(orchestrator.capture(), Err(CaptureError::AcquisitionFailed(_))));
    assert!(matches!(orchestrator.stop(), Err(CaptureError::AcquisitionFailed(_))));
}

#[test]
fn test_shutdown_within_one_poll() {
    let idle = |name, bounds| {
        ScriptedDuplication::new(output(name, bounds, Rotation::Identity)).idle_wait(Duration::from_secs(10))
    };
    let factory = Arc::new(SoftDeviceFactory::new(vec![idle("LEFT", LEFT), idle("RIGHT", RIGHT)]));
    let mut orchestrator = CaptureOrchestrator::start(
        factory,
        OrchestratorConfig { poll_timeout_ms: 200, ..config(FrameTarget::Cpu) },
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    orchestrator.stop().unwrap();
    assert!(started.elapsed() < Duration::from_millis(1000), "took {:?}", started.elapsed());
}
