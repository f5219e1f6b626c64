use crate::platform::Vertex;

/// Rasterizes axis-aligned textured quads (six vertices each) with point sampling.
///
/// Corner UVs are interpolated across the quad, which covers every rotation the
/// compositor emits because each quad is a rectangle in device space.
pub(super) fn draw_quads(
    target: &mut [u8],
    (tw, th): (u32, u32),
    texels: &[u8],
    (sw, sh): (u32, u32),
    vertices: &[Vertex],
) {
    let half_w = tw as f32 / 2.0;
    let half_h = th as f32 / 2.0;

    for quad in vertices.chunks_exact(6) {
        let pixels: Vec<(f32, f32, [f32; 2])> = quad
            .iter()
            .map(|v| (v.pos[0] * half_w + half_w, half_h - v.pos[1] * half_h, v.tex))
            .collect();

        let x0 = pixels.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
        let x1 = pixels.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
        let y0 = pixels.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
        let y1 = pixels.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);
        if x1 - x0 < 0.5 || y1 - y0 < 0.5 {
            continue;
        }

        let corner = |x: f32, y: f32| {
            pixels
                .iter()
                .find(|p| (p.0 - x).abs() < 0.5 && (p.1 - y).abs() < 0.5)
                .map(|p| p.2)
        };
        let (Some(tl), Some(tr), Some(bl), Some(br)) =
            (corner(x0, y0), corner(x1, y0), corner(x0, y1), corner(x1, y1))
        else {
            continue;
        };

        let col_start = x0.round().max(0.0) as u32;
        let col_end = (x1.round().max(0.0) as u32).min(tw);
        let row_start = y0.round().max(0.0) as u32;
        let row_end = (y1.round().max(0.0) as u32).min(th);

        for row in row_start..row_end {
            let t = (row as f32 + 0.5 - y0) / (y1 - y0);
            for col in col_start..col_end {
                let s = (col as f32 + 0.5 - x0) / (x1 - x0);
                let u = lerp(lerp(tl[0], tr[0], s), lerp(bl[0], br[0], s), t);
                let v = lerp(lerp(tl[1], tr[1], s), lerp(bl[1], br[1], s), t);

                let sx = ((u * sw as f32).floor().max(0.0) as u32).min(sw.saturating_sub(1));
                let sy = ((v * sh as f32).floor().max(0.0) as u32).min(sh.saturating_sub(1));

                let src = (sy as usize * sw as usize + sx as usize) * 4;
                let dst = (row as usize * tw as usize + col as usize) * 4;
                target[dst..dst + 4].copy_from_slice(&texels[src..src + 4]);
            }
        }
    }
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(l: f32, t: f32, r: f32, b: f32, uv: [[f32; 2]; 4]) -> Vec<Vertex> {
        // uv order: top-left, top-right, bottom-left, bottom-right
        let v = |x: f32, y: f32, tex: [f32; 2]| Vertex { pos: [x, y, 0.0], tex };
        vec![
            v(l, b, uv[2]),
            v(l, t, uv[0]),
            v(r, b, uv[3]),
            v(r, b, uv[3]),
            v(l, t, uv[0]),
            v(r, t, uv[1]),
        ]
    }

    #[test]
    fn test_full_surface_identity() {
        let texels: Vec<u8> = (0..16u8).flat_map(|i| [i, i, i, 255]).collect();
        let mut target = vec![0u8; 16 * 4];
        let vertices = quad(-1.0, 1.0, 1.0, -1.0, [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);

        draw_quads(&mut target, (4, 4), &texels, (4, 4), &vertices);
        assert_eq!(target, texels);
    }

    #[test]
    fn test_horizontal_flip() {
        let texels: Vec<u8> = (0..2u8).flat_map(|i| [i, 0, 0, 255]).collect();
        let mut target = vec![0u8; 2 * 4];
        let vertices = quad(-1.0, 1.0, 1.0, -1.0, [[1.0, 0.0], [0.0, 0.0], [1.0, 1.0], [0.0, 1.0]]);

        draw_quads(&mut target, (2, 1), &texels, (2, 1), &vertices);
        assert_eq!(target[0], 1);
        assert_eq!(target[4], 0);
    }
}
