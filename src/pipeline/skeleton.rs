use crate::landmarks::CONNECTIONS;
use crate::types::{FrameSource, PoseLandmarks};

pub const MIN_DRAW_VISIBILITY: f32 = 0.3;
/// Stroke width at 1080p; scaled linearly with the shorter frame side.
const REFERENCE_THICKNESS: f32 = 6.0;
const REFERENCE_SIDE: f32 = 1080.0;

const DETECTED_LINE_COLOR: [u8; 3] = [56, 189, 248];
const DETECTED_POINT_COLOR: [u8; 3] = [248, 113, 113];
const INTERPOLATED_LINE_COLOR: [u8; 3] = [250, 204, 21];
const INTERPOLATED_POINT_COLOR: [u8; 3] = [251, 146, 60];

struct Canvas<'a> {
    buffer: &'a mut [u8],
    width: u32,
    height: u32,
}

/// Draw bones and joints of `pose` onto an RGBA buffer. Landmarks below `MIN_DRAW_VISIBILITY`
/// are skipped; the rest are blended in proportion to their visibility.
pub fn draw_skeleton(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    pose: &PoseLandmarks,
    source: FrameSource,
) {
    let (line_color, point_color) = match source {
        FrameSource::Interpolated => (INTERPOLATED_LINE_COLOR, INTERPOLATED_POINT_COLOR),
        _ => (DETECTED_LINE_COLOR, DETECTED_POINT_COLOR),
    };
    let thickness = stroke_thickness(width, height);
    let mut canvas = Canvas {
        buffer,
        width,
        height,
    };

    let points: Vec<Option<(f32, f32, f32)>> = pose
        .landmarks
        .iter()
        .map(|lm| {
            lm.is_visible(MIN_DRAW_VISIBILITY).then(|| {
                let (x, y) = lm.to_pixel(width, height);
                (x, y, lm.visibility.clamp(0.0, 1.0))
            })
        })
        .collect();

    for &(a, b) in CONNECTIONS {
        if let (Some(Some(pa)), Some(Some(pb))) = (points.get(a), points.get(b)) {
            let alpha = pa.2.min(pb.2);
            canvas.line((pa.0, pa.1), (pb.0, pb.1), line_color, alpha, thickness);
        }
    }

    let radius = thickness + 1;
    for &(x, y, alpha) in points.iter().flatten() {
        canvas.disc(x.round() as i32, y.round() as i32, radius, point_color, alpha);
    }
}

fn stroke_thickness(width: u32, height: u32) -> i32 {
    let side = width.min(height) as f32;
    ((side / REFERENCE_SIDE * REFERENCE_THICKNESS).round() as i32).max(2)
}

impl Canvas<'_> {
    /// Bresenham line stamped with a small diamond brush.
    fn line(&mut self, p0: (f32, f32), p1: (f32, f32), color: [u8; 3], alpha: f32, thickness: i32) {
        let (mut x0, mut y0) = (p0.0.round() as i32, p0.1.round() as i32);
        let (x1, y1) = (p1.0.round() as i32, p1.1.round() as i32);
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let brush = (thickness - 1).max(0) / 2;

        loop {
            for oy in -brush..=brush {
                let reach = brush - oy.abs();
                for ox in -reach..=reach {
                    self.blend(x0 + ox, y0 + oy, color, alpha);
                }
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    fn disc(&mut self, cx: i32, cy: i32, radius: i32, color: [u8; 3], alpha: f32) {
        let r2 = radius * radius;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= r2 {
                    self.blend(cx + dx, cy + dy, color, alpha);
                }
            }
        }
    }

    fn blend(&mut self, x: i32, y: i32, color: [u8; 3], alpha: f32) {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        let Some(px) = self.buffer.get_mut(idx..idx + 4) else {
            return;
        };
        for (dst, &src) in px.iter_mut().zip(color.iter()) {
            *dst = (src as f32 * alpha + *dst as f32 * (1.0 - alpha)).round() as u8;
        }
        px[3] = 255;
    }
}
