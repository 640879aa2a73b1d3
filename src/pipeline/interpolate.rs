use crate::landmarks::NUM_LANDMARKS;
use crate::types::{FrameAnalysis, FrameSource, Landmark, PoseLandmarks};

/// Interpolated frames and landmarks are trusted less than their anchors.
const INTERPOLATION_DECAY: f32 = 0.8;

/// Fill runs of missing frames bounded on both sides by a pose, if the run is at most `max_gap` long.
/// Returns the number of frames filled.
pub fn interpolate_gaps(frames: &mut [FrameAnalysis], max_gap: usize) -> usize {
    if max_gap == 0 {
        return 0;
    }

    let anchors: Vec<usize> = frames
        .iter()
        .enumerate()
        .filter(|(_, f)| f.pose.is_some())
        .map(|(i, _)| i)
        .collect();

    let mut filled = 0;
    for pair in anchors.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let gap = b - a - 1;
        if gap == 0 || gap > max_gap {
            continue;
        }
        if !frames[a + 1..b]
            .iter()
            .all(|f| f.source == FrameSource::Missing)
        {
            continue;
        }

        let (Some(start), Some(end)) = (frames[a].pose.clone(), frames[b].pose.clone()) else {
            continue;
        };
        let score = frames[a].score.min(frames[b].score) * INTERPOLATION_DECAY;
        let span = (frames[b].frame_id - frames[a].frame_id).max(1) as f32;

        let start_id = frames[a].frame_id;
        for frame in frames[a + 1..b].iter_mut() {
            let t = frame.frame_id.saturating_sub(start_id) as f32 / span;
            let mut pose = start.lerp(&end, t);
            decay(&mut pose);
            frame.pose = Some(pose);
            frame.score = score;
            frame.strategy = None;
            frame.source = FrameSource::Interpolated;
            filled += 1;
        }
    }

    if filled > 0 {
        log::info!("interpolated {filled} missing frames (max gap {max_gap})");
    }
    filled
}

/// Replace individual low-visibility landmarks in detected frames by interpolating between the
/// nearest frames (within `max_gap`) where that landmark is visible. Returns landmarks replaced.
pub fn interpolate_low_visibility(
    frames: &mut [FrameAnalysis],
    threshold: f32,
    max_gap: usize,
) -> usize {
    if max_gap == 0 {
        return 0;
    }

    let snapshot: Vec<Option<PoseLandmarks>> = frames.iter().map(|f| f.pose.clone()).collect();
    let visible_at = |i: usize, j: usize| -> Option<Landmark> {
        snapshot[i]
            .as_ref()
            .map(|p| p.landmarks[j])
            .filter(|lm| lm.is_visible(threshold))
    };

    let mut replaced = 0;
    for i in 0..frames.len() {
        if frames[i].source != FrameSource::Detected {
            continue;
        }
        for j in 0..NUM_LANDMARKS {
            let current = match &snapshot[i] {
                Some(pose) => pose.landmarks[j],
                None => continue,
            };
            if current.is_visible(threshold) {
                continue;
            }

            let before = (i.saturating_sub(max_gap)..i)
                .rev()
                .find_map(|k| visible_at(k, j).map(|lm| (k, lm)));
            let after = (i + 1..frames.len().min(i + max_gap + 1))
                .find_map(|k| visible_at(k, j).map(|lm| (k, lm)));

            let (Some((k0, lm0)), Some((k1, lm1))) = (before, after) else {
                continue;
            };
            let t = (i - k0) as f32 / (k1 - k0) as f32;
            let mut lm = lm0.lerp(&lm1, t);
            lm.visibility = lm0.visibility.min(lm1.visibility) * INTERPOLATION_DECAY;
            lm.presence = lm0.presence.min(lm1.presence) * INTERPOLATION_DECAY;

            if let Some(pose) = frames[i].pose.as_mut() {
                pose.landmarks[j] = lm;
                replaced += 1;
            }
        }
    }

    if replaced > 0 {
        log::debug!("replaced {replaced} low-visibility landmarks by interpolation");
    }
    replaced
}

fn decay(pose: &mut PoseLandmarks) {
    for lm in pose.landmarks.iter_mut() {
        lm.visibility *= INTERPOLATION_DECAY;
        lm.presence *= INTERPOLATION_DECAY;
    }
}
