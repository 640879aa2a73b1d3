//! Kinematic-chain validation: bones keep a consistent length across a clip.

use crate::landmarks::BONES;
use crate::types::{FrameAnalysis, PoseLandmarks};

const CORRECTION_DECAY: f32 = 0.7;
/// Bones seen fewer times than this have no reliable reference length.
const MIN_SAMPLES: usize = 3;

/// Median length of every bone over frames where both ends are visible. Lengths are measured with
/// x scaled by `aspect` (width / height) so they are isotropic in pixel space.
pub fn reference_lengths(
    frames: &[FrameAnalysis],
    threshold: f32,
    aspect: f32,
) -> Vec<Option<f32>> {
    BONES
        .iter()
        .map(|&(parent, child)| {
            let mut lengths: Vec<f32> = frames
                .iter()
                .filter_map(|f| f.pose.as_ref())
                .filter(|p| p.get(parent).is_visible(threshold) && p.get(child).is_visible(threshold))
                .map(|p| bone_length(p, parent, child, aspect))
                .filter(|len| len.is_finite() && *len > f32::EPSILON)
                .collect();
            if lengths.len() < MIN_SAMPLES {
                return None;
            }
            lengths.sort_by(|a, b| a.total_cmp(b));
            Some(median(&lengths))
        })
        .collect()
}

/// Pull child joints whose bone length deviates from the clip reference by more than `tolerance`
/// (relative) back onto the reference length. Returns the number of landmarks corrected.
pub fn validate_kinematics(
    frames: &mut [FrameAnalysis],
    threshold: f32,
    tolerance: f32,
    aspect: f32,
) -> usize {
    let aspect = if aspect > f32::EPSILON { aspect } else { 1.0 };
    let references = reference_lengths(frames, threshold, aspect);

    let mut total = 0;
    for frame in frames.iter_mut() {
        let Some(pose) = frame.pose.as_mut() else {
            continue;
        };
        let corrected = correct_pose(pose, &references, threshold, tolerance, aspect);
        frame.corrected_landmarks += corrected;
        total += corrected;
    }

    if total > 0 {
        log::info!("kinematic validation corrected {total} landmarks");
    }
    total
}

fn correct_pose(
    pose: &mut PoseLandmarks,
    references: &[Option<f32>],
    threshold: f32,
    tolerance: f32,
    aspect: f32,
) -> usize {
    let mut corrected = 0;
    for (&(parent, child), reference) in BONES.iter().zip(references) {
        let Some(reference) = *reference else {
            continue;
        };
        if !pose.get(parent).is_visible(threshold) {
            continue;
        }

        let length = bone_length(pose, parent, child, aspect);
        if length <= f32::EPSILON || ((length - reference) / reference).abs() <= tolerance {
            continue;
        }

        let p = *pose.get(parent);
        let c = pose.landmarks[child];
        let dx = (c.x - p.x) * aspect;
        let dy = c.y - p.y;
        let ratio = reference / length;

        let lm = &mut pose.landmarks[child];
        lm.x = p.x + dx * ratio / aspect;
        lm.y = p.y + dy * ratio;
        lm.visibility *= CORRECTION_DECAY;
        lm.presence *= CORRECTION_DECAY;
        corrected += 1;
    }
    corrected
}

fn bone_length(pose: &PoseLandmarks, parent: usize, child: usize, aspect: f32) -> f32 {
    let a = pose.get(parent);
    let b = pose.get(child);
    (((b.x - a.x) * aspect).powi(2) + (b.y - a.y).powi(2)).sqrt()
}

fn median(sorted: &[f32]) -> f32 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::index::*;
    use crate::pipeline::strategy::Strategy;
    use crate::types::test_support::standing_pose;

    fn clip(poses: Vec<PoseLandmarks>) -> Vec<FrameAnalysis> {
        poses
            .into_iter()
            .enumerate()
            .map(|(i, p)| FrameAnalysis::detected(i, i as f64 / 30.0, p, Strategy::Original, 0.9))
            .collect()
    }

    #[test]
    fn median_of_even_and_odd() {
        assert_eq!(median(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }

    #[test]
    fn consistent_clip_is_untouched() {
        let mut frames = clip(vec![standing_pose(); 5]);
        assert_eq!(validate_kinematics(&mut frames, 0.5, 0.35, 1.0), 0);
        assert_eq!(frames[2].pose.as_ref().unwrap(), &standing_pose());
    }

    #[test]
    fn stretched_forearm_is_pulled_back() {
        let mut poses = vec![standing_pose(); 5];
        // Forearm normally 0.02 wide, 0.13 tall; push the wrist far down.
        poses[2].landmarks[LEFT_WRIST].y = 0.90;
        let mut frames = clip(poses);

        let corrected = validate_kinematics(&mut frames, 0.5, 0.35, 1.0);
        assert!(corrected >= 1);
        assert!(frames[2].corrected_landmarks >= 1);

        let pose = frames[2].pose.as_ref().unwrap();
        let reference = bone_length(&standing_pose(), LEFT_ELBOW, LEFT_WRIST, 1.0);
        let fixed = bone_length(pose, LEFT_ELBOW, LEFT_WRIST, 1.0);
        assert!((fixed - reference).abs() < 1e-4);
        assert!(pose.get(LEFT_WRIST).visibility < 0.95);
        // Direction is kept: the wrist still hangs below the elbow.
        assert!(pose.get(LEFT_WRIST).y > pose.get(LEFT_ELBOW).y);
    }

    #[test]
    fn too_few_samples_means_no_reference() {
        let frames = clip(vec![standing_pose(); 2]);
        assert!(reference_lengths(&frames, 0.5, 1.0).iter().all(Option::is_none));
    }
}
