use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::landmarks::NUM_LANDMARKS;
use crate::types::{Frame, Landmark, PoseLandmarks};

pub const INPUT_SIZE: u32 = 256;
pub const VALUES_PER_LANDMARK: usize = 5;

/// Landmark in model input pixels: `[x, y, z, visibility_logit, presence_logit]`.
pub type RawLandmark = [f32; VALUES_PER_LANDMARK];

#[derive(Clone, Debug)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

#[derive(Clone, Debug)]
pub struct CropTransform {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
    pub output_size: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

/// Maps model-input pixel coordinates back onto the source frame.
pub trait Projection {
    /// Returns original-frame pixel coordinates.
    fn project(&self, x: f32, y: f32) -> (f32, f32);
    /// Model pixels per original pixel.
    fn pixel_scale(&self) -> f32;
    fn original_size(&self) -> (u32, u32);
}

impl Projection for LetterboxInfo {
    fn project(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    fn pixel_scale(&self) -> f32 {
        self.scale
    }

    fn original_size(&self) -> (u32, u32) {
        (self.orig_w, self.orig_h)
    }
}

impl Projection for CropTransform {
    fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let half = self.output_size as f32 / 2.0;
        let scale = self.side / self.output_size as f32;
        let dx = (x - half) * scale;
        let dy = (y - half) * scale;
        let cos = self.angle.cos();
        let sin = self.angle.sin();
        (
            self.center.0 + dx * cos - dy * sin,
            self.center.1 + dx * sin + dy * cos,
        )
    }

    fn pixel_scale(&self) -> f32 {
        self.output_size as f32 / self.side.max(1.0)
    }

    fn original_size(&self) -> (u32, u32) {
        (self.orig_w, self.orig_h)
    }
}

fn check_frame(frame: &Frame) -> Result<()> {
    if frame.width == 0 || frame.height == 0 {
        return Err(anyhow!("empty frame {}x{}", frame.width, frame.height));
    }
    if frame.rgba.len() != frame.expected_len() {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgba.len(),
            frame.expected_len()
        ));
    }
    Ok(())
}

/// Letterbox the frame into a `target_size` square NHWC tensor with values in `[0, 1]`.
pub fn prepare_frame_with_size(
    frame: &Frame,
    target_size: u32,
) -> Result<(Array4<f32>, LetterboxInfo)> {
    check_frame(frame)?;

    let scale = target_size as f32 / (frame.width.max(frame.height) as f32);
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, target_size);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, target_size);

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("letterbox resize failed")?;
    let resized = dst_image.into_vec();

    let pad_x = ((target_size - new_w) / 2) as usize;
    let pad_y = ((target_size - new_h) / 2) as usize;
    let side = target_size as usize;
    let mut canvas = vec![0u8; side * side * 4];
    for px in canvas.chunks_mut(4) {
        px[3] = 255;
    }
    let dst_stride = side * 4;
    let src_stride = new_w as usize * 4;
    for (row, src_row) in resized.chunks_exact(src_stride).enumerate() {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 4;
        canvas[dst_offset..dst_offset + src_stride].copy_from_slice(src_row);
    }

    let normalized: Vec<f32> = canvas
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();
    let input = Array4::<f32>::from_shape_vec((1, side, side, 3), normalized)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((input, letterbox))
}

/// Sample a `side`-pixel square around `center`, rotated by `angle`, into an
/// `output_size` square tensor. Pixels outside the frame are black.
pub fn prepare_rotated_crop(
    frame: &Frame,
    center: (f32, f32),
    side: f32,
    angle: f32,
    output_size: u32,
) -> Result<(Array4<f32>, CropTransform)> {
    check_frame(frame)?;

    let half = output_size as f32 / 2.0;
    let scale = side / output_size as f32;
    let cos = angle.cos();
    let sin = angle.sin();
    let size = output_size as usize;

    let data: Vec<f32> = (0..size)
        .into_par_iter()
        .flat_map_iter(|y| {
            let dy = (y as f32 + 0.5 - half) * scale;
            (0..size).flat_map(move |x| {
                let dx = (x as f32 + 0.5 - half) * scale;
                let src_x = center.0 + dx * cos - dy * sin;
                let src_y = center.1 + dx * sin + dy * cos;
                sample_rgb(frame, src_x, src_y)
            })
        })
        .collect();

    let array = Array4::<f32>::from_shape_vec((1, size, size, 3), data)
        .map_err(|err| anyhow!("failed to build crop tensor: {err}"))?;

    let transform = CropTransform {
        center,
        side,
        angle,
        output_size,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((array, transform))
}

fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if x.is_nan() || y.is_nan() {
        return [0.0, 0.0, 0.0];
    }
    let x0 = x.floor();
    let y0 = y.floor();

    let (w, h) = (frame.width as i32, frame.height as i32);
    let fetch = |cx: f32, cy: f32| -> [f32; 3] {
        let ix = cx as i32;
        let iy = cy as i32;
        if ix < 0 || iy < 0 || ix >= w || iy >= h {
            return [0.0, 0.0, 0.0];
        }
        let idx = ((iy as u32 * frame.width + ix as u32) as usize) * 4;
        [
            frame.rgba[idx] as f32 / 255.0,
            frame.rgba[idx + 1] as f32 / 255.0,
            frame.rgba[idx + 2] as f32 / 255.0,
        ]
    };

    let fx = x - x0;
    let fy = y - y0;
    let c00 = fetch(x0, y0);
    let c10 = fetch(x0 + 1.0, y0);
    let c01 = fetch(x0, y0 + 1.0);
    let c11 = fetch(x0 + 1.0, y0 + 1.0);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    [0, 1, 2].map(|c| lerp(lerp(c00[c], c10[c], fx), lerp(c01[c], c11[c], fx), fy))
}

pub fn decode_landmarks(flat: &[f32]) -> Result<Vec<RawLandmark>> {
    let needed = NUM_LANDMARKS * VALUES_PER_LANDMARK;
    if flat.len() < needed {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need at least {}",
            flat.len(),
            needed
        ));
    }

    Ok(flat
        .chunks_exact(VALUES_PER_LANDMARK)
        .take(NUM_LANDMARKS)
        .map(|c| [c[0], c[1], c[2], c[3], c[4]])
        .collect())
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// The presence head is usually already a probability; some exports emit a logit.
pub fn normalize_score(raw: f32) -> f32 {
    if (0.0..=1.0).contains(&raw) {
        raw
    } else {
        sigmoid(raw)
    }
}

/// Project raw model landmarks into normalized original-frame coordinates.
pub fn to_pose<P: Projection>(raw: &[RawLandmark], projection: &P, score: f32) -> PoseLandmarks {
    let (orig_w, orig_h) = projection.original_size();
    let (w, h) = (orig_w.max(1) as f32, orig_h.max(1) as f32);
    let z_scale = projection.pixel_scale().max(f32::EPSILON) * w;

    let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
    for (lm, [x, y, z, vis, pres]) in landmarks.iter_mut().zip(raw.iter()) {
        let (px, py) = projection.project(*x, *y);
        *lm = Landmark::new(px / w, py / h, z / z_scale, sigmoid(*vis), sigmoid(*pres));
    }
    PoseLandmarks::new(landmarks, score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pads_the_short_side() {
        let frame = Frame::filled(200, 100, 0, [255, 0, 0, 255]);
        let (input, letterbox) = prepare_frame_with_size(&frame, 64).unwrap();
        assert_eq!(input.shape(), &[1, 64, 64, 3]);
        assert_eq!(letterbox.pad_x, 0.0);
        assert_eq!(letterbox.pad_y, 16.0);
        // Padding rows are black, content rows are red.
        assert_eq!(input[[0, 0, 10, 0]], 0.0);
        assert!(input[[0, 32, 10, 0]] > 0.99);
        assert_eq!(input[[0, 32, 10, 1]], 0.0);
    }

    #[test]
    fn letterbox_projection_round_trips_center() {
        let frame = Frame::filled(200, 100, 0, [0, 0, 0, 255]);
        let (_, letterbox) = prepare_frame_with_size(&frame, 64).unwrap();
        let (x, y) = letterbox.project(32.0, 32.0);
        assert!((x - 100.0).abs() < 1e-3);
        assert!((y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn crop_projection_maps_center_to_center() {
        let transform = CropTransform {
            center: (120.0, 80.0),
            side: 100.0,
            angle: 0.0,
            output_size: 256,
            orig_w: 320,
            orig_h: 240,
        };
        let (x, y) = transform.project(128.0, 128.0);
        assert!((x - 120.0).abs() < 1e-3);
        assert!((y - 80.0).abs() < 1e-3);
        let (x, _) = transform.project(256.0, 128.0);
        assert!((x - 170.0).abs() < 1e-3);
    }

    #[test]
    fn crop_outside_frame_is_black() {
        let frame = Frame::filled(10, 10, 0, [255, 255, 255, 255]);
        let (crop, _) = prepare_rotated_crop(&frame, (-100.0, -100.0), 20.0, 0.0, 8).unwrap();
        assert!(crop.iter().all(|v| *v == 0.0));
        let (crop, _) = prepare_rotated_crop(&frame, (5.0, 5.0), 4.0, 0.0, 8).unwrap();
        assert!(crop.iter().all(|v| *v > 0.99));
    }

    #[test]
    fn decode_rejects_short_output() {
        assert!(decode_landmarks(&[0.0; 10]).is_err());
        // 33 body points followed by the auxiliary ROI points, which are dropped.
        let flat = vec![1.0; 39 * VALUES_PER_LANDMARK];
        assert_eq!(decode_landmarks(&flat).unwrap().len(), NUM_LANDMARKS);
    }

    #[test]
    fn to_pose_normalizes_and_applies_sigmoid() {
        let frame = Frame::filled(200, 100, 0, [0, 0, 0, 255]);
        let (_, letterbox) = prepare_frame_with_size(&frame, 64).unwrap();
        let raw = vec![[32.0, 32.0, 0.0, 0.0, 100.0]; NUM_LANDMARKS];
        let pose = to_pose(&raw, &letterbox, 0.8);
        let lm = pose.get(0);
        assert!((lm.x - 0.5).abs() < 1e-3);
        assert!((lm.y - 0.5).abs() < 1e-3);
        assert!((lm.visibility - 0.5).abs() < 1e-6);
        assert!(lm.presence > 0.99);
        assert_eq!(pose.score, 0.8);
    }

    #[test]
    fn score_normalization() {
        assert_eq!(normalize_score(0.7), 0.7);
        assert!(normalize_score(5.0) > 0.99);
        assert!(normalize_score(-5.0) < 0.01);
    }
}
