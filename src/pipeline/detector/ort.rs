use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    PoseEngine,
    common::{self, INPUT_SIZE, RawLandmark},
};
use crate::config::{AnalysisConfig, ModelConfig};
use crate::model_download::ensure_pose_model_ready;
use crate::types::{Frame, PoseLandmarks};

/// A ROI crop is this much larger than the bounding box of the first-pass landmarks.
const ROI_EXPANSION: f32 = 1.25;
const ROI_MIN_SIDE: f32 = 32.0;
const ROI_LANDMARK_THRESHOLD: f32 = 0.5;

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub min_pose_confidence: f32,
    pub roi_refinement: bool,
    pub intra_threads: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_pose_confidence: 0.5,
            roi_refinement: true,
            intra_threads: 2,
        }
    }
}

impl DetectorConfig {
    pub fn from_config(model: &ModelConfig, analysis: &AnalysisConfig) -> Self {
        Self {
            min_pose_confidence: analysis.min_pose_confidence,
            roi_refinement: analysis.roi_refinement,
            intra_threads: model.intra_threads.max(1),
        }
    }
}

pub struct OrtPoseEngine {
    session: Session,
    cfg: DetectorConfig,
}

impl OrtPoseEngine {
    pub fn new(model_path: &Path, cfg: DetectorConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(cfg.intra_threads)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to load pose model from {}", model_path.display())
            })?;

        log::info!(
            "pose ORT backend ready using {} (roi refinement: {})",
            model_path.display(),
            cfg.roi_refinement
        );

        Ok(Self { session, cfg })
    }

    /// Download the model if needed, then load it.
    pub fn load(model: &ModelConfig, analysis: &AnalysisConfig) -> Result<Self> {
        ensure_pose_model_ready(&model.path, |_evt| {}).with_context(|| {
            format!("failed to prepare pose model at {}", model.path.display())
        })?;
        Self::new(&model.path, DetectorConfig::from_config(model, analysis))
    }

    fn run_model(&mut self, input: Array4<f32>) -> Result<(Vec<RawLandmark>, f32)> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run pose landmark session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "pose model returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flattened: Vec<f32> = coords.iter().copied().collect();
        let landmarks = common::decode_landmarks(&flattened)?;

        let score = outputs[1]
            .try_extract_array::<f32>()
            .ok()
            .and_then(|arr| arr.iter().next().copied())
            .map(common::normalize_score)
            .unwrap_or(0.0);

        Ok((landmarks, score))
    }

    fn detect_full_frame(&mut self, frame: &Frame) -> Result<PoseLandmarks> {
        let (input, letterbox) = common::prepare_frame_with_size(frame, INPUT_SIZE)?;
        let (raw, score) = self.run_model(input)?;
        Ok(common::to_pose(&raw, &letterbox, score))
    }

    fn refine(&mut self, frame: &Frame, coarse: &PoseLandmarks) -> Result<Option<PoseLandmarks>> {
        let Some([x0, y0, x1, y1]) = coarse.bounding_box(ROI_LANDMARK_THRESHOLD) else {
            return Ok(None);
        };
        let (w, h) = (frame.width as f32, frame.height as f32);
        let center = ((x0 + x1) / 2.0 * w, (y0 + y1) / 2.0 * h);
        let side = (((x1 - x0) * w).max((y1 - y0) * h) * ROI_EXPANSION).max(ROI_MIN_SIDE);

        let (input, transform) =
            common::prepare_rotated_crop(frame, center, side, 0.0, INPUT_SIZE)?;
        let (raw, score) = self.run_model(input)?;
        Ok(Some(common::to_pose(&raw, &transform, score)))
    }
}

/// Prefer the ROI pass only when it scores strictly higher, then drop poses below `min_confidence`.
fn choose_pose(
    coarse: PoseLandmarks,
    refined: Option<PoseLandmarks>,
    min_confidence: f32,
) -> Option<PoseLandmarks> {
    let pose = match refined {
        Some(refined) if refined.score > coarse.score => refined,
        _ => coarse,
    };
    (pose.score >= min_confidence).then_some(pose)
}

impl PoseEngine for OrtPoseEngine {
    fn detect(&mut self, frame: &Frame) -> Result<Option<PoseLandmarks>> {
        let coarse = self.detect_full_frame(frame)?;

        let refined = if self.cfg.roi_refinement && coarse.score >= self.cfg.min_pose_confidence {
            self.refine(frame, &coarse).unwrap_or_else(|err| {
                log::warn!("roi refinement failed on frame {}: {err:?}", frame.index);
                None
            })
        } else {
            None
        };

        Ok(choose_pose(coarse, refined, self.cfg.min_pose_confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{shifted, standing_pose};

    fn scored(score: f32, dx: f32) -> PoseLandmarks {
        let mut pose = shifted(&standing_pose(), dx, 0.0);
        pose.score = score;
        pose
    }

    #[test]
    fn refined_pose_wins_only_when_strictly_better() {
        let coarse = scored(0.7, 0.0);

        let better = choose_pose(coarse.clone(), Some(scored(0.8, 0.01)), 0.5).unwrap();
        assert_eq!(better, scored(0.8, 0.01));

        let tie = choose_pose(coarse.clone(), Some(scored(0.7, 0.01)), 0.5).unwrap();
        assert_eq!(tie, coarse);

        let worse = choose_pose(coarse.clone(), Some(scored(0.6, 0.01)), 0.5).unwrap();
        assert_eq!(worse, coarse);
    }

    #[test]
    fn low_confidence_pose_is_rejected() {
        assert!(choose_pose(scored(0.4, 0.0), None, 0.5).is_none());
        assert_eq!(choose_pose(scored(0.5, 0.0), None, 0.5), Some(scored(0.5, 0.0)));
    }
}
