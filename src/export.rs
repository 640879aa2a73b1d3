use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::landmarks::landmark_name;
use crate::pipeline::strategy::{Mode, Strategy};
use crate::types::{FrameAnalysis, FrameSource};

pub const CSV_HEADER: &str =
    "frame_id,timestamp,landmark_id,landmark_name,x,y,z,visibility,confidence";
pub const CSV_FILE: &str = "landmarks.csv";
pub const SUMMARY_FILE: &str = "summary.json";
pub const OVERLAY_FILE: &str = "overlay.mp4";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub video: String,
    pub fps: f64,
    pub total_frames: usize,
    pub detected_frames: usize,
    pub interpolated_frames: usize,
    pub missing_frames: usize,
    pub detection_rate: f32,
    pub average_score: f32,
    pub strategy_usage: BTreeMap<Strategy, usize>,
    pub kinematic_corrections: usize,
    pub mode: Mode,
    pub csv: String,
    #[serde(default)]
    pub overlay_video: Option<String>,
}

impl AnalysisSummary {
    pub fn from_frames(video: &str, fps: f64, mode: Mode, frames: &[FrameAnalysis]) -> Self {
        let count = |source: FrameSource| frames.iter().filter(|f| f.source == source).count();
        let detected_frames = count(FrameSource::Detected);
        let interpolated_frames = count(FrameSource::Interpolated);
        let missing_frames = count(FrameSource::Missing);

        let scored: Vec<f32> = frames
            .iter()
            .filter(|f| f.pose.is_some())
            .map(|f| f.score)
            .collect();
        let average_score = if scored.is_empty() {
            0.0
        } else {
            scored.iter().sum::<f32>() / scored.len() as f32
        };

        let mut strategy_usage = BTreeMap::new();
        for strategy in frames.iter().filter_map(|f| f.strategy) {
            *strategy_usage.entry(strategy).or_insert(0) += 1;
        }

        Self {
            video: video.to_string(),
            fps,
            total_frames: frames.len(),
            detected_frames,
            interpolated_frames,
            missing_frames,
            detection_rate: if frames.is_empty() {
                0.0
            } else {
                detected_frames as f32 / frames.len() as f32
            },
            average_score,
            strategy_usage,
            kinematic_corrections: frames.iter().map(|f| f.corrected_landmarks).sum(),
            mode,
            csv: CSV_FILE.to_string(),
            overlay_video: None,
        }
    }
}

/// Write one row per landmark for every frame that has a pose.
pub fn write_csv_to<W: Write>(writer: &mut W, frames: &[FrameAnalysis]) -> Result<usize> {
    writeln!(writer, "{CSV_HEADER}")?;
    let mut rows = 0;
    for frame in frames {
        let Some(pose) = frame.pose.as_ref() else {
            continue;
        };
        for (id, lm) in pose.landmarks.iter().enumerate() {
            writeln!(
                writer,
                "{},{:.6},{},{},{:.6},{:.6},{:.6},{:.6},{:.6}",
                frame.frame_id,
                frame.timestamp,
                id,
                landmark_name(id),
                lm.x,
                lm.y,
                lm.z,
                lm.visibility,
                (lm.presence * frame.score).clamp(0.0, 1.0),
            )?;
            rows += 1;
        }
    }
    Ok(rows)
}

pub fn write_csv(path: &Path, frames: &[FrameAnalysis]) -> Result<usize> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let rows = write_csv_to(&mut writer, frames)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(rows)
}

pub fn write_summary(path: &Path, summary: &AnalysisSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

pub fn read_summary(path: &Path) -> Result<AnalysisSummary> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::standing_pose;

    fn frames() -> Vec<FrameAnalysis> {
        let mut interpolated =
            FrameAnalysis::detected(1, 1.0 / 30.0, standing_pose(), Strategy::Original, 0.5);
        interpolated.strategy = None;
        interpolated.source = FrameSource::Interpolated;
        vec![
            FrameAnalysis::detected(0, 0.0, standing_pose(), Strategy::Mirrored, 0.8),
            interpolated,
            FrameAnalysis::missing(2, 2.0 / 30.0),
        ]
    }

    #[test]
    fn csv_has_header_and_one_row_per_landmark() {
        let mut out = Vec::new();
        let rows = write_csv_to(&mut out, &frames()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(rows, 66);
        assert_eq!(lines.len(), 67);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "0,0.000000,0,nose,0.500000,0.150000,0.000000,0.950000,0.760000");
        assert!(lines[34].starts_with("1,0.033333,0,nose,"));
        assert!(lines.iter().all(|l| !l.starts_with("2,")));
    }

    #[test]
    fn summary_counts_sources_and_strategies() {
        let summary = AnalysisSummary::from_frames("clip.mp4", 30.0, Mode::Full, &frames());
        assert_eq!(summary.total_frames, 3);
        assert_eq!(summary.detected_frames, 1);
        assert_eq!(summary.interpolated_frames, 1);
        assert_eq!(summary.missing_frames, 1);
        assert!((summary.average_score - 0.65).abs() < 1e-6);
        assert_eq!(summary.strategy_usage.get(&Strategy::Mirrored), Some(&1));
        assert_eq!(summary.strategy_usage.len(), 1);
    }

    #[test]
    fn summary_survives_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SUMMARY_FILE);
        let mut summary = AnalysisSummary::from_frames("clip.mp4", 25.0, Mode::Fast, &frames());
        summary.overlay_video = Some(OVERLAY_FILE.to_string());
        write_summary(&path, &summary).unwrap();
        assert_eq!(read_summary(&path).unwrap(), summary);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"mirrored\": 1"));
        assert!(raw.contains("\"mode\": \"fast\""));
    }
}
