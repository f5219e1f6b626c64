//! Pointer state shared by every output worker.
//!
//! Each output reports the pointer relative to itself and only when it changed there.
//! [`PointerTracker::merge`] folds those reports into one desktop-wide state.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::geometry::{Point, Rect};
use crate::platform::PointerShapeInfo;
use crate::session::DuplicatedFrame;

/// Pointer information carried by one acquired frame.
#[derive(Debug, Clone, Copy)]
pub struct PointerUpdate<'a> {
    /// Zero means the frame carried no pointer information.
    pub timestamp: i64,
    /// Position relative to the reporting output.
    pub position: Point,
    pub visible: bool,
    pub shape: Option<(PointerShapeInfo, &'a [u8])>,
}

impl<'a> PointerUpdate<'a> {
    pub fn from_frame<T>(frame: &'a DuplicatedFrame<T>) -> Self {
        Self {
            timestamp: frame.info.last_mouse_update_time,
            position: frame.info.pointer.position,
            visible: frame.info.pointer.visible,
            shape: frame
                .pointer_shape_info
                .map(|info| (info, frame.pointer_shape_bytes())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerSnapshot {
    /// Position in shared-surface coordinates.
    pub position: Point,
    pub visible: bool,
    pub timestamp: i64,
    pub last_writer: Option<u32>,
    pub shape_info: Option<PointerShapeInfo>,
    pub shape: Vec<u8>,
}

#[derive(Default)]
struct PointerState {
    position: Point,
    visible: bool,
    timestamp: i64,
    last_writer: Option<u32>,
    shape: Vec<u8>,
    shape_len: usize,
    shape_info: Option<PointerShapeInfo>,
    shape_reallocations: u32,
}

#[derive(Default)]
pub struct PointerTracker {
    state: Mutex<PointerState>,
}

impl PointerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds an update from output `source` into the shared state. `bounds` is the
    /// output's desktop rectangle and `origin` the desktop position of the shared
    /// surface's top-left corner. Returns whether the position was taken.
    ///
    /// Before the first accepted update there is no owner, so no output counts as a
    /// different writer and the first update is always taken, visible or not.
    pub fn merge(&self, update: &PointerUpdate<'_>, source: u32, bounds: &Rect, origin: Point) -> bool {
        if update.timestamp == 0 {
            return false;
        }

        let mut state = self.state.lock();
        let other_writer = state.last_writer.is_some_and(|writer| writer != source);

        let accept = if !update.visible && other_writer {
            debug!("Output {} reported hidden pointer owned by {:?}", source, state.last_writer);
            false
        } else if update.visible && state.visible && other_writer && state.timestamp > update.timestamp {
            warn!(
                "Output {} pointer update at {} is older than {:?} at {}",
                source, update.timestamp, state.last_writer, state.timestamp
            );
            false
        } else {
            true
        };

        if accept {
            state.position = Point::new(
                update.position.x + bounds.left - origin.x,
                update.position.y + bounds.top - origin.y,
            );
            state.visible = update.visible;
            state.timestamp = state.timestamp.max(update.timestamp);
            state.last_writer = Some(source);
        }

        if let Some((info, bytes)) = update.shape {
            if !bytes.is_empty() {
                if bytes.len() > state.shape.len() {
                    state.shape = vec![0u8; bytes.len()];
                    state.shape_reallocations += 1;
                }
                state.shape[..bytes.len()].copy_from_slice(bytes);
                state.shape_len = bytes.len();
                state.shape_info = Some(info);
            }
        }

        accept
    }

    pub fn snapshot(&self) -> PointerSnapshot {
        let state = self.state.lock();
        PointerSnapshot {
            position: state.position,
            visible: state.visible,
            timestamp: state.timestamp,
            last_writer: state.last_writer,
            shape_info: state.shape_info,
            shape: state.shape[..state.shape_len].to_vec(),
        }
    }

    pub fn shape_capacity(&self) -> usize {
        self.state.lock().shape.len()
    }

    pub fn shape_reallocations(&self) -> u32 {
        self.state.lock().shape_reallocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LEFT: Rect = Rect::new(0, 0, 1920, 1080);
    const RIGHT: Rect = Rect::new(1920, 0, 3840, 1080);

    fn update(timestamp: i64, x: i32, visible: bool) -> PointerUpdate<'static> {
        PointerUpdate {
            timestamp,
            position: Point::new(x, 10),
            visible,
            shape: None,
        }
    }

    #[test]
    fn test_position_is_translated() {
        let tracker = PointerTracker::new();
        assert!(tracker.merge(&update(1, 5, true), 1, &RIGHT, Point::new(0, 0)));
        assert_eq!(tracker.snapshot().position, Point::new(1925, 10));

        let tracker = PointerTracker::new();
        tracker.merge(&update(1, 5, true), 0, &Rect::new(-1280, 0, 0, 1024), Point::new(-1280, 0));
        assert_eq!(tracker.snapshot().position, Point::new(5, 10));
    }

    #[test]
    fn test_hidden_from_other_output_ignored() {
        let tracker = PointerTracker::new();
        tracker.merge(&update(5, 100, true), 0, &LEFT, Point::default());
        assert!(!tracker.merge(&update(6, 0, false), 1, &RIGHT, Point::default()));

        let snapshot = tracker.snapshot();
        assert!(snapshot.visible);
        assert_eq!(snapshot.last_writer, Some(0));
    }

    #[test]
    fn test_hidden_from_owner_accepted() {
        let tracker = PointerTracker::new();
        tracker.merge(&update(5, 100, true), 0, &LEFT, Point::default());
        assert!(tracker.merge(&update(6, 100, false), 0, &LEFT, Point::default()));
        assert!(!tracker.snapshot().visible);
    }

    #[test]
    fn test_first_update_has_no_owner() {
        let tracker = PointerTracker::new();
        assert!(tracker.merge(&update(3, 40, false), 1, &RIGHT, Point::default()));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.last_writer, Some(1));
        assert_eq!(snapshot.timestamp, 3);
        assert!(!snapshot.visible);
    }

    #[test]
    fn test_stale_visible_update_ignored() {
        let tracker = PointerTracker::new();
        tracker.merge(&update(10, 100, true), 0, &LEFT, Point::default());
        assert!(!tracker.merge(&update(7, 50, true), 1, &RIGHT, Point::default()));
        assert_eq!(tracker.snapshot().timestamp, 10);
    }

    #[test]
    fn test_no_pointer_info_skipped() {
        let tracker = PointerTracker::new();
        assert!(!tracker.merge(&update(0, 100, true), 0, &LEFT, Point::default()));
        assert_eq!(tracker.snapshot(), PointerSnapshot::default());
    }

    #[test]
    fn test_shape_buffer_grows_only() {
        let tracker = PointerTracker::new();
        let info = PointerShapeInfo { width: 4, height: 4, pitch: 16, ..Default::default() };

        let big = vec![1u8; 64];
        let small = vec![2u8; 16];
        for (bytes, visible) in [(&big, true), (&small, true), (&big, false)] {
            let update = PointerUpdate {
                timestamp: 1,
                position: Point::default(),
                visible,
                shape: Some((info, bytes.as_slice())),
            };
            tracker.merge(&update, 0, &LEFT, Point::default());
        }

        assert_eq!(tracker.shape_capacity(), 64);
        assert_eq!(tracker.shape_reallocations(), 1);
        assert_eq!(tracker.snapshot().shape.len(), 64);
    }

    #[test]
    fn test_empty_shape_keeps_previous() {
        let tracker = PointerTracker::new();
        let info = PointerShapeInfo { width: 1, height: 1, pitch: 4, ..Default::default() };
        let bytes = [9u8; 4];
        let with_shape = PointerUpdate { timestamp: 1, position: Point::default(), visible: true, shape: Some((info, &bytes[..])) };
        let empty = PointerUpdate { shape: Some((info, &bytes[..0])), ..with_shape };

        tracker.merge(&with_shape, 0, &LEFT, Point::default());
        tracker.merge(&empty, 0, &LEFT, Point::default());
        assert_eq!(tracker.snapshot().shape, vec![9u8; 4]);
    }

    proptest! {
        #[test]
        fn test_later_update_from_other_output_wins(
            t1 in 1i64..1_000_000,
            delta in 1i64..1_000_000,
            a_first in any::<bool>(),
            a in 0u32..4,
            b_offset in 1u32..4,
        ) {
            let b = a + b_offset;
            let t2 = t1 + delta;
            let tracker = PointerTracker::new();

            if a_first {
                tracker.merge(&update(t1, 1, true), a, &LEFT, Point::default());
                prop_assert!(tracker.merge(&update(t2, 2, true), b, &RIGHT, Point::default()));
            } else {
                // B's newer report lands first; A's older one must not overwrite it.
                tracker.merge(&update(t2, 2, true), b, &RIGHT, Point::default());
                prop_assert!(!tracker.merge(&update(t1, 1, true), a, &LEFT, Point::default()));
            }

            let snapshot = tracker.snapshot();
            prop_assert_eq!(snapshot.timestamp, t2);
            prop_assert_eq!(snapshot.last_writer, Some(b));
        }

        #[test]
        fn test_timestamp_never_decreases(updates in proptest::collection::vec((1i64..1000, any::<bool>(), 0u32..3), 1..64)) {
            let tracker = PointerTracker::new();
            let mut last = 0;
            for (timestamp, visible, output) in updates {
                tracker.merge(&update(timestamp, 0, visible), output, &LEFT, Point::default());
                let now = tracker.snapshot().timestamp;
                prop_assert!(now >= last);
                last = now;
            }
        }
    }
}
