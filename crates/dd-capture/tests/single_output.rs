mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{read_all, script, solid};
use dd_capture::soft::{ScriptStep, ScriptedFrame, SoftDevice, SoftDeviceFactory};
use dd_capture::{
    Capture, CaptureConfig, CaptureError, CaptureMode, DriverType, Frame, FrameSource, FrameTarget, Rect,
    ScreenCaptureManager, SingleOutputCapturer,
};

const SCREEN: Rect = Rect::new(0, 0, 32, 16);

fn changed(color: [u8; 4]) -> ScriptedFrame {
    ScriptedFrame {
        pixels: Some(solid(32, 16, color)),
        dirty: vec![SCREEN],
        ..Default::default()
    }
}

#[test]
fn test_timeouts_yield_repeats_without_touching_pool() {
    let dup = script("SOFT1", SCREEN)
        .step(ScriptStep::Timeout)
        .step(ScriptStep::Timeout)
        .step(ScriptStep::Timeout);
    let probe = dup.probe();
    let device = Arc::new(SoftDevice::with_outputs(vec![dup]));
    let mut capturer = SingleOutputCapturer::new(device, 0, None, FrameTarget::Cpu, 30, 500).unwrap();

    assert!(capturer.capture().unwrap().is_repeat(), "startup capture");
    for _ in 0..3 {
        assert!(capturer.capture().unwrap().is_repeat());
    }

    assert_eq!(capturer.pool_stats().created, 0);
    assert_eq!(probe.counts().timeouts, 3);
}

#[test]
fn test_outstanding_frames_never_share_buffers() {
    let mut dup = script("SOFT1", SCREEN);
    for i in 0..6u8 {
        dup = dup.frame(changed([i, i, i, 255]));
    }
    let device = Arc::new(SoftDevice::with_outputs(vec![dup]));
    let mut capturer = SingleOutputCapturer::new(device, 0, None, FrameTarget::Cpu, 30, 500).unwrap();
    capturer.capture().unwrap();

    let mut held: Vec<Frame<SoftDevice>> = Vec::new();
    for _ in 0..4 {
        held.push(capturer.capture().unwrap().into_frame().unwrap());
    }
    let ids: HashSet<u64> = held
        .iter()
        .map(|frame| match frame {
            Frame::Cpu(cpu) => cpu.buffer_id(),
            Frame::Gpu(gpu) => gpu.texture_id(),
        })
        .collect();
    assert_eq!(ids.len(), 4);

    // Each frame still shows the image it was captured from.
    for (i, frame) in held.iter().enumerate() {
        assert_eq!(read_all(frame)[0], i as u8);
    }

    for frame in &mut held {
        assert!(frame.dispose());
        assert!(!frame.dispose());
    }
    let stats = capturer.pool_stats();
    assert_eq!((stats.created, stats.available, stats.outstanding), (4, 4, 0));

    // Returned buffers are reused rather than new ones created.
    let frame = capturer.capture().unwrap().into_frame().unwrap();
    assert_eq!(capturer.pool_stats().created, 4);
    drop(frame);
}

#[test]
fn test_release_precedes_next_acquire() {
    let mut dup = script("SOFT1", SCREEN);
    for i in 0..10u8 {
        dup = dup.frame(changed([i, 0, 0, 255]));
    }
    let probe = dup.probe();
    let device = Arc::new(SoftDevice::with_outputs(vec![dup]));
    let mut capturer = SingleOutputCapturer::new(device, 0, None, FrameTarget::Gpu, 30, 500).unwrap();

    let mut frames = 0;
    for _ in 0..12 {
        if let Capture::Frame(_) = capturer.capture().unwrap() {
            frames += 1;
        }
    }

    assert_eq!(frames, 10);
    let counts = probe.counts();
    assert_eq!(counts.violations, 0);
    assert_eq!(counts.releases, 10);
}

#[test]
fn test_unsupported_is_surfaced() {
    let dup = script("SOFT1", SCREEN).step(ScriptStep::Fail(CaptureError::Unsupported("no hardware support".into())));
    let device = Arc::new(SoftDevice::with_outputs(vec![dup]));
    let mut capturer = SingleOutputCapturer::new(device, 0, None, FrameTarget::Cpu, 30, 500).unwrap();

    capturer.capture().unwrap();
    let err = capturer.capture().err().unwrap();
    assert!(matches!(err, CaptureError::Unsupported(_)));
    assert!(!err.is_recoverable());
    assert!(err.to_string().contains("integrated graphics"));
}

#[test]
fn test_second_session_on_same_output_unavailable() {
    let device = Arc::new(SoftDevice::with_outputs(vec![script("SOFT1", SCREEN)]));
    let _first = SingleOutputCapturer::new(device.clone(), 0, None, FrameTarget::Cpu, 30, 500).unwrap();
    let second = SingleOutputCapturer::new(device, 0, None, FrameTarget::Cpu, 30, 500);
    assert!(matches!(second, Err(CaptureError::SessionUnavailable)));
}

#[test]
fn test_manager_falls_back_to_warp() {
    let factory = Arc::new(
        SoftDeviceFactory::new(vec![script("SOFT1", SCREEN).frame(changed([7, 7, 7, 255]))])
            .failing_drivers(&[DriverType::Hardware]),
    );
    let config = CaptureConfig {
        mode: CaptureMode::Single { output: 0, region: Some(Rect::new(0, 0, 16, 16)) },
        ..Default::default()
    };
    let mut manager = ScreenCaptureManager::new(factory.clone(), &config).unwrap();

    assert_eq!(manager.descriptor().width, 16);
    assert!(manager.capture().unwrap().is_repeat());
    let frame = manager.capture().unwrap().into_frame().unwrap();
    assert_eq!(read_all(&frame), solid(16, 16, [7, 7, 7, 255]));
    assert_eq!(factory.attempts(), vec![DriverType::Hardware, DriverType::Warp]);
}
