//! Per-result quality score used to pick between preprocessing strategies.

use serde::Serialize;

use crate::config::ScoreWeights;
use crate::landmarks::{LIMB_PAIRS, NUM_LANDMARKS, index::*};
use crate::types::PoseLandmarks;

/// Mean displacement (normalized units) at which the temporal score reaches zero.
const MAX_FRAME_DISPLACEMENT: f32 = 0.2;
const MAX_LIMB_RATIO: f32 = 2.0;
const MIN_TORSO_ASPECT: f32 = 0.05;
const BOUNDS_MARGIN: f32 = 0.1;
const NEUTRAL: f32 = 0.5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub visibility: f32,
    pub anatomical: f32,
    pub temporal: f32,
    pub symmetry: f32,
    pub total: f32,
}

pub fn score_pose(
    pose: &PoseLandmarks,
    previous: Option<&PoseLandmarks>,
    weights: &ScoreWeights,
    visibility_threshold: f32,
) -> ScoreBreakdown {
    let visibility = visibility_score(pose, visibility_threshold);
    let anatomical = anatomical_score(pose, visibility_threshold);
    let temporal = previous
        .map(|prev| temporal_score(pose, prev, visibility_threshold))
        .unwrap_or(1.0);
    let symmetry = symmetry_score(pose, visibility_threshold);

    let weight_sum = weights.visibility + weights.anatomical + weights.temporal + weights.symmetry;
    let total = if weight_sum > 0.0 {
        (visibility * weights.visibility
            + anatomical * weights.anatomical
            + temporal * weights.temporal
            + symmetry * weights.symmetry)
            / weight_sum
    } else {
        0.0
    };

    ScoreBreakdown {
        visibility,
        anatomical,
        temporal,
        symmetry,
        total: total.clamp(0.0, 1.0),
    }
}

/// Half mean visibility, half share of landmarks above the threshold.
pub fn visibility_score(pose: &PoseLandmarks, threshold: f32) -> f32 {
    let visible = pose
        .landmarks
        .iter()
        .filter(|l| l.is_visible(threshold))
        .count();
    let fraction = visible as f32 / NUM_LANDMARKS as f32;
    (0.5 * pose.mean_visibility() + 0.5 * fraction).clamp(0.0, 1.0)
}

pub fn anatomical_score(pose: &PoseLandmarks, threshold: f32) -> f32 {
    let mut score = 1.0f32;
    let seen = |i: usize| pose.get(i).is_visible(threshold);

    let shoulders_seen = seen(LEFT_SHOULDER) && seen(RIGHT_SHOULDER);
    let hips_seen = seen(LEFT_HIP) && seen(RIGHT_HIP);
    let shoulder_y = (pose.get(LEFT_SHOULDER).y + pose.get(RIGHT_SHOULDER).y) / 2.0;
    let hip_y = (pose.get(LEFT_HIP).y + pose.get(RIGHT_HIP).y) / 2.0;

    if shoulders_seen && hips_seen {
        if shoulder_y > hip_y {
            score -= 0.3;
        }

        let torso_width = pose.get(LEFT_SHOULDER).distance_2d(pose.get(RIGHT_SHOULDER));
        let torso_height = (hip_y - shoulder_y).abs();
        if torso_height > f32::EPSILON && torso_width < torso_height * MIN_TORSO_ASPECT {
            score -= 0.2;
        }
    }

    if shoulders_seen && seen(NOSE) && pose.get(NOSE).y > shoulder_y {
        score -= 0.2;
    }

    for &((la, lb), (ra, rb)) in LIMB_PAIRS {
        if !(seen(la) && seen(lb) && seen(ra) && seen(rb)) {
            continue;
        }
        let left = pose.get(la).distance_2d(pose.get(lb));
        let right = pose.get(ra).distance_2d(pose.get(rb));
        let (short, long) = (left.min(right), left.max(right));
        if short <= f32::EPSILON || long / short > MAX_LIMB_RATIO {
            score -= 0.1;
        }
    }

    let out_of_bounds = pose
        .landmarks
        .iter()
        .filter(|l| {
            let range = -BOUNDS_MARGIN..=1.0 + BOUNDS_MARGIN;
            !range.contains(&l.x) || !range.contains(&l.y)
        })
        .count();
    score -= 0.2 * out_of_bounds as f32 / NUM_LANDMARKS as f32;

    score.clamp(0.0, 1.0)
}

pub fn temporal_score(pose: &PoseLandmarks, previous: &PoseLandmarks, threshold: f32) -> f32 {
    let displacements: Vec<f32> = pose
        .landmarks
        .iter()
        .zip(previous.landmarks.iter())
        .filter(|(a, b)| a.is_visible(threshold) && b.is_visible(threshold))
        .map(|(a, b)| a.distance_2d(b))
        .collect();

    if displacements.is_empty() {
        return NEUTRAL;
    }
    let mean = displacements.iter().sum::<f32>() / displacements.len() as f32;
    (1.0 - mean / MAX_FRAME_DISPLACEMENT).clamp(0.0, 1.0)
}

pub fn symmetry_score(pose: &PoseLandmarks, threshold: f32) -> f32 {
    let seen = |i: usize| pose.get(i).is_visible(threshold);
    let ratios: Vec<f32> = LIMB_PAIRS
        .iter()
        .filter(|((la, lb), (ra, rb))| seen(*la) && seen(*lb) && seen(*ra) && seen(*rb))
        .map(|&((la, lb), (ra, rb))| {
            let left = pose.get(la).distance_2d(pose.get(lb));
            let right = pose.get(ra).distance_2d(pose.get(rb));
            let long = left.max(right);
            if long <= f32::EPSILON {
                0.0
            } else {
                left.min(right) / long
            }
        })
        .collect();

    if ratios.is_empty() {
        return NEUTRAL;
    }
    ratios.iter().sum::<f32>() / ratios.len() as f32
}
