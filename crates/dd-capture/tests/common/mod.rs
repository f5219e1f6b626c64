#![allow(dead_code)]

use std::time::{Duration, Instant};

use dd_capture::soft::{ScriptedDuplication, SoftDevice};
use dd_capture::{Capture, Frame, FrameSource, OutputDescription, Rect, Rotation};

pub fn output(name: &str, bounds: Rect, rotation: Rotation) -> OutputDescription {
    OutputDescription {
        name: name.into(),
        desktop_bounds: bounds,
        rotation,
        attached_to_desktop: true,
    }
}

pub fn script(name: &str, bounds: Rect) -> ScriptedDuplication {
    ScriptedDuplication::new(output(name, bounds, Rotation::Identity)).idle_wait(Duration::from_millis(2))
}

pub fn solid(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    color.repeat((width * height) as usize)
}

pub fn pixel(data: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let offset = ((y * width + x) * 4) as usize;
    [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]
}

pub fn read_all(frame: &Frame<SoftDevice>) -> Vec<u8> {
    let len = frame.stride() * frame.height() as usize;
    let mut out = vec![0u8; len];
    frame.copy_to(&mut out, len).unwrap();
    out
}

/// Captures until a delivered frame satisfies `accept`, or panics after `limit`.
pub fn capture_until<S>(source: &mut S, limit: Duration, mut accept: impl FnMut(&[u8]) -> bool) -> Vec<u8>
where
    S: FrameSource<Device = SoftDevice>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Capture::Frame(frame) = source.capture().unwrap() {
            let data = read_all(&frame);
            if accept(&data) {
                return data;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("no matching frame within {:?}", limit);
}
