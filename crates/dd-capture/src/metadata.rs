use tracing::debug;

use crate::geometry::{MoveRect, Rect};
use crate::platform::{DIRTY_RECT_SIZE, MOVE_RECT_SIZE, OutputDuplication};
use crate::Result;

/// Move and dirty rectangles of one frame.
///
/// The backing buffers are sized from the platform's metadata byte count and only grow;
/// a frame that fits in the current capacity reuses them.
#[derive(Debug, Default, Clone)]
pub struct FrameMetadata {
    moves: Vec<MoveRect>,
    dirty: Vec<Rect>,
    move_count: usize,
    dirty_count: usize,
    capacity_bytes: u32,
    reallocations: u32,
}

impl FrameMetadata {
    pub fn move_rects(&self) -> &[MoveRect] {
        &self.moves[..self.move_count]
    }

    pub fn dirty_rects(&self) -> &[Rect] {
        &self.dirty[..self.dirty_count]
    }

    pub fn is_empty(&self) -> bool {
        self.move_count == 0 && self.dirty_count == 0
    }

    pub fn capacity_bytes(&self) -> u32 {
        self.capacity_bytes
    }

    /// How many times the buffers were reallocated over their lifetime.
    pub fn reallocations(&self) -> u32 {
        self.reallocations
    }

    pub fn clear(&mut self) {
        self.move_count = 0;
        self.dirty_count = 0;
    }

    /// Grows the buffers to hold `total_bytes` of metadata. Returns true if it reallocated.
    pub fn ensure_capacity(&mut self, total_bytes: u32) -> bool {
        if total_bytes <= self.capacity_bytes {
            return false;
        }

        self.moves = vec![MoveRect::default(); (total_bytes / MOVE_RECT_SIZE) as usize];
        self.dirty = vec![Rect::default(); (total_bytes / DIRTY_RECT_SIZE) as usize];
        self.capacity_bytes = total_bytes;
        self.reallocations += 1;
        debug!("Metadata buffers grown to {} bytes", total_bytes);
        true
    }

    /// Pulls the move and dirty rectangles of the currently held frame.
    pub fn fill<P: OutputDuplication + ?Sized>(&mut self, duplication: &mut P, total_bytes: u32) -> Result<()> {
        self.clear();
        if total_bytes == 0 {
            return Ok(());
        }

        self.ensure_capacity(total_bytes);
        self.move_count = duplication.move_rects(&mut self.moves)?.min(self.moves.len());
        self.dirty_count = duplication.dirty_rects(&mut self.dirty)?.min(self.dirty.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_reallocates_once() {
        let mut metadata = FrameMetadata::default();
        assert!(metadata.ensure_capacity(10 * DIRTY_RECT_SIZE));
        let before = metadata.reallocations();

        assert!(metadata.ensure_capacity(50 * DIRTY_RECT_SIZE));
        assert_eq!(metadata.reallocations(), before + 1);
        assert_eq!(metadata.capacity_bytes(), 50 * DIRTY_RECT_SIZE);
        assert_eq!(metadata.dirty.len(), 50);

        for count in [1, 20, 49, 50] {
            assert!(!metadata.ensure_capacity(count * DIRTY_RECT_SIZE));
        }
        assert_eq!(metadata.reallocations(), before + 1);
    }

    #[test]
    fn test_capacity_never_shrinks() {
        let mut metadata = FrameMetadata::default();
        metadata.ensure_capacity(4096);
        metadata.ensure_capacity(16);
        metadata.clear();
        assert_eq!(metadata.capacity_bytes(), 4096);
        assert!(metadata.is_empty());
    }
}
