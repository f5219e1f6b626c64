use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Edge-exclusive rectangle in pixel coordinates (`right`/`bottom` are one past the last pixel).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    #[inline]
    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    #[inline]
    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        self.width() as i64 * self.height() as i64
    }

    pub const fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub const fn contains_rect(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect::new(
            self.left.min(other.left),
            self.top.min(other.top),
            self.right.max(other.right),
            self.bottom.max(other.bottom),
        )
    }

    pub const fn offset(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.left + dx, self.top + dy, self.right + dx, self.bottom + dy)
    }

    pub const fn origin(&self) -> Point {
        Point::new(self.left, self.top)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    #[default]
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    pub const fn degrees(&self) -> u32 {
        match self {
            Rotation::Identity => 0,
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        }
    }

    /// True when the duplicated surface is stored with width and height swapped.
    pub const fn swaps_axes(&self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }
}

/// A region whose pixels moved from `source` to `destination` since the previous frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveRect {
    pub source: Point,
    pub destination: Rect,
}

/// Per-monitor description, fixed for the lifetime of a duplication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescription {
    pub name: String,
    pub desktop_bounds: Rect,
    pub rotation: Rotation,
    pub attached_to_desktop: bool,
}

impl OutputDescription {
    pub fn width(&self) -> u32 {
        self.desktop_bounds.width().max(0) as u32
    }

    pub fn height(&self) -> u32 {
        self.desktop_bounds.height().max(0) as u32
    }

    /// Size of the duplicated surface, which is stored unrotated.
    pub fn surface_size(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.height(), self.width())
        } else {
            (self.width(), self.height())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_union_and_area() {
        let a = Rect::new(0, 0, 1920, 1080);
        let b = Rect::new(1920, -200, 3200, 824);
        let u = a.union(&b);
        assert_eq!(u, Rect::new(0, -200, 3200, 1080));
        assert_eq!(u.area(), 3200 * 1280);
        assert_eq!(Rect::new(5, 5, 5, 10).area(), 0);
    }

    #[test]
    fn test_surface_size_rotated() {
        let desc = OutputDescription {
            name: "DISPLAY2".into(),
            desktop_bounds: Rect::new(1920, 0, 3000, 1920),
            rotation: Rotation::Rotate90,
            attached_to_desktop: true,
        };
        assert_eq!(desc.width(), 1080);
        assert_eq!(desc.surface_size(), (1920, 1080));
    }
}
