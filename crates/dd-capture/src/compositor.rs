//! Incremental compositing of one output into the shared desktop surface.
//!
//! Only the regions the platform reports as changed are touched: move rectangles are
//! block copies within the shared surface, dirty rectangles are textured quads drawn
//! from the freshly acquired output image. Duplicated surfaces are stored unrotated, so
//! both kinds of rectangle are mapped into desktop orientation first.

use std::sync::Arc;
use tracing::debug;

use crate::geometry::{MoveRect, OutputDescription, Point, Rect, Rotation};
use crate::metadata::FrameMetadata;
use crate::platform::{FrameInfo, GpuDevice, TextureDesc, Vertex};
use crate::Result;

/// Vertices emitted per dirty rectangle (two triangles).
pub const VERTICES_PER_QUAD: usize = 6;

/// Maps a move rectangle into desktop orientation. `tex_width`/`tex_height` are the
/// acquired surface's dimensions. Returns `(source, destination)` relative to the output.
pub fn transform_move_rect(rotation: Rotation, move_rect: &MoveRect, tex_width: i32, tex_height: i32) -> (Rect, Rect) {
    let src = move_rect.source;
    let dest = move_rect.destination;
    let (w, h) = (dest.width(), dest.height());

    match rotation {
        Rotation::Identity => (Rect::new(src.x, src.y, src.x + w, src.y + h), dest),
        Rotation::Rotate90 => (
            Rect::new(tex_height - (src.y + h), src.x, tex_height - src.y, src.x + w),
            Rect::new(tex_height - dest.bottom, dest.left, tex_height - dest.top, dest.right),
        ),
        Rotation::Rotate180 => (
            Rect::new(tex_width - (src.x + w), tex_height - (src.y + h), tex_width - src.x, tex_height - src.y),
            Rect::new(tex_width - dest.right, tex_height - dest.bottom, tex_width - dest.left, tex_height - dest.top),
        ),
        Rotation::Rotate270 => (
            Rect::new(src.y, tex_width - (src.x + w), src.y + h, tex_width - src.x),
            Rect::new(dest.top, tex_width - dest.right, dest.bottom, tex_width - dest.left),
        ),
    }
}

/// Maps a dirty rectangle of the acquired surface into desktop orientation.
/// `width`/`height` are the output's desktop dimensions.
pub fn transform_dirty_rect(rotation: Rotation, dirty: &Rect, width: i32, height: i32) -> Rect {
    match rotation {
        Rotation::Identity => *dirty,
        Rotation::Rotate90 => Rect::new(width - dirty.bottom, dirty.left, width - dirty.top, dirty.right),
        Rotation::Rotate180 => Rect::new(
            width - dirty.right,
            height - dirty.bottom,
            width - dirty.left,
            height - dirty.top,
        ),
        Rotation::Rotate270 => Rect::new(dirty.top, height - dirty.right, dirty.bottom, height - dirty.left),
    }
}

/// Builds the two triangles that blit `dirty` from the acquired surface (`source_size`)
/// into the shared surface (`target_size`) whose top-left sits at `offset` on the desktop.
///
/// Vertex order: 0 bottom-left, 1 top-left, 2 bottom-right, 3 = 2, 4 = 1, 5 top-right.
pub fn dirty_quad(
    dirty: &Rect,
    description: &OutputDescription,
    offset: Point,
    target_size: (u32, u32),
    source_size: (u32, u32),
) -> [Vertex; VERTICES_PER_QUAD] {
    let center_x = target_size.0 as f32 / 2.0;
    let center_y = target_size.1 as f32 / 2.0;
    let (sw, sh) = (source_size.0 as f32, source_size.1 as f32);
    let bounds = description.desktop_bounds;

    let dest = transform_dirty_rect(description.rotation, dirty, bounds.width(), bounds.height());
    let uv = |x: i32, y: i32| [x as f32 / sw, y as f32 / sh];
    let (l, t, r, b) = (dirty.left, dirty.top, dirty.right, dirty.bottom);

    // Texture coordinates for the bottom-left, top-left, bottom-right and top-right corners.
    let [bl, tl, br, tr] = match description.rotation {
        Rotation::Identity => [uv(l, b), uv(l, t), uv(r, b), uv(r, t)],
        Rotation::Rotate90 => [uv(r, b), uv(l, b), uv(r, t), uv(l, t)],
        Rotation::Rotate180 => [uv(r, t), uv(r, b), uv(l, t), uv(l, b)],
        Rotation::Rotate270 => [uv(l, t), uv(r, t), uv(l, b), uv(r, b)],
    };

    let pos = |x: i32, y: i32| {
        [
            (x + bounds.left - offset.x) as f32 / center_x - 1.0,
            -((y + bounds.top - offset.y) as f32 / center_y - 1.0),
            0.0,
        ]
    };
    let vertex = |pos: [f32; 3], tex: [f32; 2]| Vertex { pos, tex };

    let v0 = vertex(pos(dest.left, dest.bottom), bl);
    let v1 = vertex(pos(dest.left, dest.top), tl);
    let v2 = vertex(pos(dest.right, dest.bottom), br);
    let v5 = vertex(pos(dest.right, dest.top), tr);
    [v0, v1, v2, v2, v1, v5]
}

/// Composites one output's frames into the shared surface. Owned by that output's
/// worker; the render pipeline is created on first use and lives as long as the
/// compositor.
pub struct SurfaceCompositor<D: GpuDevice> {
    device: Arc<D>,
    target: D::Texture,
    target_size: (u32, u32),
    offset: Point,
    description: OutputDescription,
    move_surface: Option<D::Texture>,
    pipeline: Option<D::Pipeline>,
    vertices: Vec<Vertex>,
    vertex_reallocations: u32,
}

impl<D: GpuDevice> SurfaceCompositor<D> {
    /// `target` is the shared surface as opened on `device`; `offset` is the desktop
    /// position of its top-left corner.
    pub fn new(device: Arc<D>, target: D::Texture, offset: Point, description: OutputDescription) -> Self {
        let target_size = device.texture_size(&target);
        Self {
            device,
            target,
            target_size,
            offset,
            description,
            move_surface: None,
            pipeline: None,
            vertices: Vec::new(),
            vertex_reallocations: 0,
        }
    }

    pub fn description(&self) -> &OutputDescription {
        &self.description
    }

    pub fn vertex_capacity(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex_reallocations(&self) -> u32 {
        self.vertex_reallocations
    }

    /// Applies one frame's move and dirty rectangles. The caller serializes access to the
    /// shared surface across workers.
    pub fn process(&mut self, surface: &D::Texture, info: &FrameInfo, metadata: &FrameMetadata) -> Result<()> {
        if info.total_metadata_buffer_size == 0 || metadata.is_empty() {
            return Ok(());
        }

        self.device.lock_shared(&self.target)?;
        let result = self.apply(surface, metadata);
        self.device.flush();
        self.device.unlock_shared(&self.target);
        result
    }

    fn apply(&mut self, surface: &D::Texture, metadata: &FrameMetadata) -> Result<()> {
        if !metadata.move_rects().is_empty() {
            let (tex_width, tex_height) = self.device.texture_size(surface);
            self.copy_moves(metadata.move_rects(), tex_width as i32, tex_height as i32)?;
        }
        if !metadata.dirty_rects().is_empty() {
            self.copy_dirty(surface, metadata.dirty_rects())?;
        }
        Ok(())
    }

    fn copy_moves(&mut self, moves: &[MoveRect], tex_width: i32, tex_height: i32) -> Result<()> {
        let bounds = self.description.desktop_bounds;
        if self.move_surface.is_none() {
            let desc = TextureDesc::gpu(self.description.width(), self.description.height());
            self.move_surface = Some(self.device.create_texture(&desc)?);
            debug!("Created {}x{} move surface for {}", desc.width, desc.height, self.description.name);
        }
        let Some(staging) = self.move_surface.as_ref() else {
            return Ok(());
        };

        let (dx, dy) = (bounds.left - self.offset.x, bounds.top - self.offset.y);
        for move_rect in moves {
            let (src, dest) = transform_move_rect(self.description.rotation, move_rect, tex_width, tex_height);

            // Source and destination may overlap, so go through the move surface.
            self.device
                .copy_region(&self.target, &src.offset(dx, dy), staging, to_u32(src.left), to_u32(src.top));
            self.device.copy_region(
                staging,
                &src,
                &self.target,
                to_u32(dest.left + dx),
                to_u32(dest.top + dy),
            );
        }
        Ok(())
    }

    fn copy_dirty(&mut self, surface: &D::Texture, dirty: &[Rect]) -> Result<()> {
        if self.pipeline.is_none() {
            self.pipeline = Some(self.device.create_blit_pipeline(&self.target)?);
        }

        let required = dirty.len() * VERTICES_PER_QUAD;
        if self.vertices.len() < required {
            self.vertices = vec![Vertex::default(); required];
            self.vertex_reallocations += 1;
            debug!("Vertex buffer grown to {} quads", dirty.len());
        }

        let source_size = self.device.texture_size(surface);
        for (quad, rect) in self.vertices.chunks_exact_mut(VERTICES_PER_QUAD).zip(dirty) {
            quad.copy_from_slice(&dirty_quad(rect, &self.description, self.offset, self.target_size, source_size));
        }

        match self.pipeline.as_mut() {
            Some(pipeline) => self.device.draw_quads(pipeline, surface, &self.vertices[..required]),
            None => Ok(()),
        }
    }
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}
