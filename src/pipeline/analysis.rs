use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;

use super::detector::PoseEngine;
use super::interpolate::{interpolate_gaps, interpolate_low_visibility};
use super::kinematic::validate_kinematics;
use super::selector::StrategySelector;
use super::skeleton::draw_skeleton;
use super::strategy::Mode;
use crate::config::AnalysisConfig;
use crate::export::{
    AnalysisSummary, CSV_FILE, OVERLAY_FILE, SUMMARY_FILE, write_csv, write_summary,
};
use crate::types::{Frame, FrameAnalysis, PoseLandmarks};
use crate::video;

const FRAMES_DIR: &str = "frames";
const OVERLAY_DIR: &str = "overlay";

/// Run strategy selection over a stream of frames, then (in full mode) fill gaps and enforce
/// consistent bone lengths. `progress` receives `(processed, total)` after every frame.
pub fn analyze_frames<E, I>(
    engine: &mut E,
    frames: I,
    total: usize,
    fps: f64,
    cfg: &AnalysisConfig,
    progress: &dyn Fn(usize, usize),
) -> Vec<FrameAnalysis>
where
    E: PoseEngine + ?Sized,
    I: IntoIterator<Item = Result<Frame>>,
{
    let selector = StrategySelector::from_config(cfg);
    let fps = if fps > 0.0 { fps } else { video::DEFAULT_FPS };

    let mut results = Vec::with_capacity(total);
    let mut previous: Option<PoseLandmarks> = None;
    let mut dims: Option<(u32, u32)> = None;

    for (frame_id, frame) in frames.into_iter().enumerate() {
        let timestamp = frame_id as f64 / fps;
        let analysis = match frame {
            Ok(frame) => {
                dims.get_or_insert((frame.width, frame.height));
                let selection = selector.select(engine, &frame, previous.as_ref());
                match selection.best {
                    Some(best) => {
                        previous = Some(best.pose.clone());
                        FrameAnalysis::detected(
                            frame_id,
                            timestamp,
                            best.pose,
                            best.strategy,
                            best.score.total,
                        )
                    }
                    None => {
                        previous = None;
                        FrameAnalysis::missing(frame_id, timestamp)
                    }
                }
            }
            Err(err) => {
                log::warn!("skipping frame {frame_id}: {err:?}");
                previous = None;
                FrameAnalysis::missing(frame_id, timestamp)
            }
        };
        results.push(analysis);
        progress(frame_id + 1, total.max(frame_id + 1));
    }

    if cfg.mode == Mode::Full {
        interpolate_gaps(&mut results, cfg.max_interpolation_gap);
        interpolate_low_visibility(
            &mut results,
            cfg.visibility_threshold,
            cfg.max_interpolation_gap,
        );
        let aspect = dims
            .filter(|(_, h)| *h > 0)
            .map(|(w, h)| w as f32 / h as f32)
            .unwrap_or(1.0);
        validate_kinematics(
            &mut results,
            cfg.visibility_threshold,
            cfg.bone_length_tolerance,
            aspect,
        );
    }

    results
}

/// Draw every analysed pose onto its source frame and write numbered PNGs to `dir`.
pub fn render_overlay(paths: &[PathBuf], frames: &[FrameAnalysis], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create overlay directory {}", dir.display()))?;

    paths
        .par_iter()
        .zip(frames.par_iter())
        .try_for_each(|(path, analysis)| -> Result<()> {
            let mut frame = video::load_frame(path, analysis.frame_id)?;
            if let Some(pose) = analysis.pose.as_ref() {
                draw_skeleton(
                    &mut frame.rgba,
                    frame.width,
                    frame.height,
                    pose,
                    analysis.source,
                );
            }
            video::save_frame(
                &frame,
                &dir.join(format!("frame_{:06}.png", analysis.frame_id)),
            )
        })
}

pub struct Analyzer {
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyse a video file, or a directory of already extracted frames, and write
    /// `landmarks.csv`, `summary.json` and optionally `overlay.mp4` into `output_dir`.
    /// `video_name` is recorded in the summary as the clip's display name.
    pub fn run<E: PoseEngine + ?Sized>(
        &self,
        engine: &mut E,
        input: &Path,
        video_name: &str,
        output_dir: &Path,
        progress: &dyn Fn(usize, usize),
    ) -> Result<AnalysisSummary> {
        fs::create_dir_all(output_dir).with_context(|| {
            format!("failed to create output directory {}", output_dir.display())
        })?;

        if input.is_dir() {
            return self.run_frames(
                engine,
                input,
                video_name,
                input,
                video::DEFAULT_FPS,
                output_dir,
                progress,
            );
        }

        let fps = video::probe_fps(input)?;
        let scratch = ScratchDir(output_dir.join(FRAMES_DIR));
        video::extract_frames(input, &scratch.0)?;
        self.run_frames(engine, input, video_name, &scratch.0, fps, output_dir, progress)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_frames<E: PoseEngine + ?Sized>(
        &self,
        engine: &mut E,
        input: &Path,
        video_name: &str,
        frames_dir: &Path,
        fps: f64,
        output_dir: &Path,
        progress: &dyn Fn(usize, usize),
    ) -> Result<AnalysisSummary> {
        let paths = video::list_frames(frames_dir)?;
        if paths.is_empty() {
            return Err(anyhow!("no frames found in {}", frames_dir.display()));
        }
        log::info!(
            "analysing {} frames from {} at {fps:.2} fps ({} mode)",
            paths.len(),
            input.display(),
            self.config.mode
        );

        let total = paths.len();
        let (rx, reader) = video::spawn_frame_reader(paths.clone());
        let frames = analyze_frames(engine, rx.iter(), total, fps, &self.config, progress);
        reader
            .join()
            .map_err(|_| anyhow!("frame reader thread panicked"))?;

        write_csv(&output_dir.join(CSV_FILE), &frames)?;

        let mut summary = AnalysisSummary::from_frames(video_name, fps, self.config.mode, &frames);
        if self.config.render_overlay {
            summary.overlay_video = self.write_overlay(&paths, &frames, output_dir, fps);
        }

        write_summary(&output_dir.join(SUMMARY_FILE), &summary)?;

        log::info!(
            "analysis of {} finished: {}/{} frames detected, {} interpolated",
            input.display(),
            summary.detected_frames,
            summary.total_frames,
            summary.interpolated_frames
        );
        Ok(summary)
    }

    fn write_overlay(
        &self,
        paths: &[PathBuf],
        frames: &[FrameAnalysis],
        output_dir: &Path,
        fps: f64,
    ) -> Option<String> {
        let overlay_dir = ScratchDir(output_dir.join(OVERLAY_DIR));
        let result = render_overlay(paths, frames, &overlay_dir.0).and_then(|_| {
            video::encode_video(&overlay_dir.0, fps, &output_dir.join(OVERLAY_FILE))
        });

        match result {
            Ok(()) => Some(OVERLAY_FILE.to_string()),
            Err(err) => {
                log::warn!("overlay video not written: {err:?}");
                None
            }
        }
    }
}

/// Intermediate frame directory, removed when dropped whether or not the run succeeded.
struct ScratchDir(PathBuf);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.0.exists() {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.0) {
            log::warn!("failed to clean up {}: {err}", self.0.display());
        }
    }
}
