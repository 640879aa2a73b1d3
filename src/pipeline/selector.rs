use crate::config::{AnalysisConfig, ScoreWeights};
use crate::pipeline::detector::PoseEngine;
use crate::pipeline::scoring::{ScoreBreakdown, score_pose};
use crate::pipeline::strategy::Strategy;
use crate::types::{Frame, PoseLandmarks};

#[derive(Clone, Debug)]
pub struct Candidate {
    pub strategy: Strategy,
    pub pose: PoseLandmarks,
    pub score: ScoreBreakdown,
}

#[derive(Clone, Debug, Default)]
pub struct FrameSelection {
    pub best: Option<Candidate>,
}

/// Runs every enabled strategy on a frame and keeps the best-scoring pose.
pub struct StrategySelector {
    strategies: Vec<Strategy>,
    weights: ScoreWeights,
    visibility_threshold: f32,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Strategy>, weights: ScoreWeights, visibility_threshold: f32) -> Self {
        Self {
            strategies,
            weights,
            visibility_threshold,
        }
    }

    pub fn from_config(cfg: &AnalysisConfig) -> Self {
        Self::new(
            cfg.active_strategies(),
            cfg.weights,
            cfg.visibility_threshold,
        )
    }

    pub fn select<E: PoseEngine + ?Sized>(
        &self,
        engine: &mut E,
        frame: &Frame,
        previous: Option<&PoseLandmarks>,
    ) -> FrameSelection {
        let mut selection = FrameSelection::default();

        for &strategy in &self.strategies {
            let variant = match strategy.apply(frame) {
                Ok(variant) => variant,
                Err(err) => {
                    log::warn!("strategy {strategy} failed on frame {}: {err:?}", frame.index);
                    continue;
                }
            };

            let pose = match engine.detect(&variant) {
                Ok(Some(pose)) => strategy.restore(pose),
                Ok(None) => continue,
                Err(err) => {
                    log::warn!(
                        "pose inference failed on frame {} ({strategy}): {err:?}",
                        frame.index
                    );
                    continue;
                }
            };

            let score = score_pose(&pose, previous, &self.weights, self.visibility_threshold);
            log::debug!(
                "frame {} {strategy}: total {:.3} (vis {:.2} anat {:.2} temp {:.2} sym {:.2})",
                frame.index,
                score.total,
                score.visibility,
                score.anatomical,
                score.temporal,
                score.symmetry
            );

            let better = selection
                .best
                .as_ref()
                .map(|best| score.total > best.score.total)
                .unwrap_or(true);
            if better {
                selection.best = Some(Candidate {
                    strategy,
                    pose,
                    score,
                });
            }
        }

        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{shifted, standing_pose};
    use anyhow::anyhow;

    /// Returns a pose only for frames whose first pixel matches, so strategies can be told apart.
    struct ScriptedEngine {
        responses: Vec<([u8; 3], Option<PoseLandmarks>)>,
        calls: usize,
    }

    impl PoseEngine for ScriptedEngine {
        fn detect(&mut self, frame: &Frame) -> anyhow::Result<Option<PoseLandmarks>> {
            self.calls += 1;
            let px = [frame.rgba[0], frame.rgba[1], frame.rgba[2]];
            for (key, pose) in &self.responses {
                if *key == px {
                    return Ok(pose.clone());
                }
            }
            Ok(None)
        }
    }

    struct AlwaysEngine(PoseLandmarks);

    impl PoseEngine for AlwaysEngine {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Option<PoseLandmarks>> {
            Ok(Some(self.0.clone()))
        }
    }

    struct FailingEngine;

    impl PoseEngine for FailingEngine {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Option<PoseLandmarks>> {
            Err(anyhow!("boom"))
        }
    }

    fn frame() -> Frame {
        Frame::filled(4, 4, 0, [100, 100, 100, 255])
    }

    #[test]
    fn picks_highest_scoring_strategy() {
        let mut weak = standing_pose();
        for lm in weak.landmarks.iter_mut() {
            lm.visibility = 0.3;
        }
        let mut engine = ScriptedEngine {
            responses: vec![
                ([100, 100, 100], Some(weak)),
                ([140, 140, 140], Some(standing_pose())),
            ],
            calls: 0,
        };
        let selector = StrategySelector::new(
            vec![Strategy::Original, Strategy::Brightened],
            ScoreWeights::default(),
            0.5,
        );

        let selection = selector.select(&mut engine, &frame(), None);
        let best = selection.best.unwrap();
        assert_eq!(best.strategy, Strategy::Brightened);
        assert_eq!(engine.calls, 2);
    }

    #[test]
    fn ties_keep_the_earlier_strategy() {
        let mut engine = AlwaysEngine(standing_pose());
        let selector = StrategySelector::new(
            vec![Strategy::Brightened, Strategy::Contrast],
            ScoreWeights::default(),
            0.5,
        );
        let best = selector.select(&mut engine, &frame(), None).best.unwrap();
        assert_eq!(best.strategy, Strategy::Brightened);
    }

    #[test]
    fn mirrored_results_are_restored() {
        let pose = shifted(&standing_pose(), 0.1, 0.0);
        let mut engine = ScriptedEngine {
            responses: vec![([100, 100, 100], Some(pose.clone()))],
            calls: 0,
        };
        let selector =
            StrategySelector::new(vec![Strategy::Mirrored], ScoreWeights::default(), 0.5);
        let best = selector.select(&mut engine, &frame(), None).best.unwrap();
        assert_eq!(best.pose, pose.mirrored());
    }

    #[test]
    fn temporal_consistency_breaks_otherwise_equal_results() {
        let previous = standing_pose();
        let far = shifted(&standing_pose(), 0.15, 0.0);
        let near = shifted(&standing_pose(), 0.01, 0.0);
        let mut engine = ScriptedEngine {
            responses: vec![
                ([100, 100, 100], Some(far)),
                ([140, 140, 140], Some(near.clone())),
            ],
            calls: 0,
        };
        let selector = StrategySelector::new(
            vec![Strategy::Original, Strategy::Brightened],
            ScoreWeights::default(),
            0.5,
        );
        let best = selector
            .select(&mut engine, &frame(), Some(&previous))
            .best
            .unwrap();
        assert_eq!(best.pose, near);
    }

    #[test]
    fn failures_and_misses_yield_empty_selection() {
        let selector = StrategySelector::new(Strategy::ALL.to_vec(), ScoreWeights::default(), 0.5);
        let selection = selector.select(&mut FailingEngine, &frame(), None);
        assert!(selection.best.is_none());
    }
}
