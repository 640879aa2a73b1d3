use serde::{Deserialize, Serialize};

use crate::landmarks::{NUM_LANDMARKS, SYMMETRIC_PAIRS};
use crate::pipeline::strategy::Strategy;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub index: usize,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32, index: usize) -> Self {
        Self {
            rgba,
            width,
            height,
            index,
        }
    }

    /// Uniformly filled frame, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, index: usize, color: [u8; 4]) -> Self {
        let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            rgba.extend_from_slice(&color);
        }
        Self::new(rgba, width, height, index)
    }

    pub fn expected_len(&self) -> usize {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(4)
    }
}

/// One body joint. `x`/`y` are normalized to the original frame, `z` shares the scale of `x`.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub visibility: f32,
    pub presence: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32, visibility: f32, presence: f32) -> Self {
        Self {
            x,
            y,
            z,
            visibility,
            presence,
        }
    }

    pub fn is_visible(&self, threshold: f32) -> bool {
        self.visibility >= threshold
    }

    pub fn distance_2d(&self, other: &Landmark) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn lerp(&self, other: &Landmark, t: f32) -> Landmark {
        let mix = |a: f32, b: f32| a + (b - a) * t;
        Landmark {
            x: mix(self.x, other.x),
            y: mix(self.y, other.y),
            z: mix(self.z, other.z),
            visibility: mix(self.visibility, other.visibility),
            presence: mix(self.presence, other.presence),
        }
    }

    pub fn to_pixel(&self, width: u32, height: u32) -> (f32, f32) {
        (self.x * width as f32, self.y * height as f32)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoseLandmarks {
    pub landmarks: [Landmark; NUM_LANDMARKS],
    /// Pose presence reported by the model.
    pub score: f32,
}

impl PoseLandmarks {
    pub fn new(landmarks: [Landmark; NUM_LANDMARKS], score: f32) -> Self {
        Self { landmarks, score }
    }

    pub fn get(&self, index: usize) -> &Landmark {
        &self.landmarks[index]
    }

    pub fn mean_visibility(&self) -> f32 {
        self.landmarks.iter().map(|l| l.visibility).sum::<f32>() / NUM_LANDMARKS as f32
    }

    /// Mirror across the vertical axis and swap left/right joints.
    pub fn mirrored(&self) -> PoseLandmarks {
        let mut landmarks = self.landmarks;
        for lm in landmarks.iter_mut() {
            lm.x = 1.0 - lm.x;
        }
        for &(left, right) in SYMMETRIC_PAIRS {
            landmarks.swap(left, right);
        }
        PoseLandmarks {
            landmarks,
            score: self.score,
        }
    }

    pub fn lerp(&self, other: &PoseLandmarks, t: f32) -> PoseLandmarks {
        let mut landmarks = self.landmarks;
        for (lm, target) in landmarks.iter_mut().zip(other.landmarks.iter()) {
            *lm = lm.lerp(target, t);
        }
        PoseLandmarks {
            landmarks,
            score: self.score + (other.score - self.score) * t,
        }
    }

    /// Bounding box `[min_x, min_y, max_x, max_y]` of landmarks at or above `threshold`.
    pub fn bounding_box(&self, threshold: f32) -> Option<[f32; 4]> {
        let mut bbox: Option<[f32; 4]> = None;
        for lm in self.landmarks.iter().filter(|l| l.is_visible(threshold)) {
            bbox = Some(match bbox {
                None => [lm.x, lm.y, lm.x, lm.y],
                Some([x0, y0, x1, y1]) => [x0.min(lm.x), y0.min(lm.y), x1.max(lm.x), y1.max(lm.y)],
            });
        }
        bbox
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSource {
    Detected,
    Interpolated,
    Missing,
}

#[derive(Clone, Debug)]
pub struct FrameAnalysis {
    pub frame_id: usize,
    pub timestamp: f64,
    pub pose: Option<PoseLandmarks>,
    pub strategy: Option<Strategy>,
    pub score: f32,
    pub source: FrameSource,
    pub corrected_landmarks: usize,
}

impl FrameAnalysis {
    pub fn missing(frame_id: usize, timestamp: f64) -> Self {
        Self {
            frame_id,
            timestamp,
            pose: None,
            strategy: None,
            score: 0.0,
            source: FrameSource::Missing,
            corrected_landmarks: 0,
        }
    }

    pub fn detected(
        frame_id: usize,
        timestamp: f64,
        pose: PoseLandmarks,
        strategy: Strategy,
        score: f32,
    ) -> Self {
        Self {
            frame_id,
            timestamp,
            pose: Some(pose),
            strategy: Some(strategy),
            score,
            source: FrameSource::Detected,
            corrected_landmarks: 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::landmarks::index::*;

    /// Upright, roughly proportioned figure centered in the frame.
    pub fn standing_pose() -> PoseLandmarks {
        let mut lms = [Landmark::new(0.5, 0.5, 0.0, 0.95, 0.95); NUM_LANDMARKS];
        let mut set = |i: usize, x: f32, y: f32| {
            lms[i].x = x;
            lms[i].y = y;
        };
        set(NOSE, 0.50, 0.15);
        set(LEFT_EYE_INNER, 0.51, 0.13);
        set(LEFT_EYE, 0.52, 0.13);
        set(LEFT_EYE_OUTER, 0.53, 0.13);
        set(RIGHT_EYE_INNER, 0.49, 0.13);
        set(RIGHT_EYE, 0.48, 0.13);
        set(RIGHT_EYE_OUTER, 0.47, 0.13);
        set(LEFT_EAR, 0.55, 0.14);
        set(RIGHT_EAR, 0.45, 0.14);
        set(MOUTH_LEFT, 0.52, 0.18);
        set(MOUTH_RIGHT, 0.48, 0.18);
        set(LEFT_SHOULDER, 0.60, 0.28);
        set(RIGHT_SHOULDER, 0.40, 0.28);
        set(LEFT_ELBOW, 0.64, 0.42);
        set(RIGHT_ELBOW, 0.36, 0.42);
        set(LEFT_WRIST, 0.66, 0.55);
        set(RIGHT_WRIST, 0.34, 0.55);
        set(LEFT_PINKY, 0.67, 0.58);
        set(RIGHT_PINKY, 0.33, 0.58);
        set(LEFT_INDEX, 0.66, 0.59);
        set(RIGHT_INDEX, 0.34, 0.59);
        set(LEFT_THUMB, 0.65, 0.57);
        set(RIGHT_THUMB, 0.35, 0.57);
        set(LEFT_HIP, 0.57, 0.56);
        set(RIGHT_HIP, 0.43, 0.56);
        set(LEFT_KNEE, 0.58, 0.72);
        set(RIGHT_KNEE, 0.42, 0.72);
        set(LEFT_ANKLE, 0.58, 0.88);
        set(RIGHT_ANKLE, 0.42, 0.88);
        set(LEFT_HEEL, 0.57, 0.90);
        set(RIGHT_HEEL, 0.43, 0.90);
        set(LEFT_FOOT_INDEX, 0.60, 0.92);
        set(RIGHT_FOOT_INDEX, 0.40, 0.92);
        PoseLandmarks::new(lms, 0.9)
    }

    pub fn shifted(pose: &PoseLandmarks, dx: f32, dy: f32) -> PoseLandmarks {
        let mut out = pose.clone();
        for lm in out.landmarks.iter_mut() {
            lm.x += dx;
            lm.y += dy;
        }
        out
    }
}
