use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::strategy::{Mode, Strategy};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_addr() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}
fn default_max_upload_bytes() -> usize {
    500 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            upload_dir: default_upload_dir(),
            output_dir: default_output_dir(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_processing: usize,
    #[serde(default = "default_max_pending")]
    pub max_pending_jobs: usize,
    #[serde(default = "default_job_ttl")]
    pub job_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_concurrent() -> usize {
    2
}
fn default_max_pending() -> usize {
    10
}
fn default_job_ttl() -> u64 {
    3600
}
fn default_sweep_interval() -> u64 {
    300
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_processing: default_max_concurrent(),
            max_pending_jobs: default_max_pending(),
            job_ttl_secs: default_job_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default = "crate::model_download::default_pose_model_path")]
    pub path: PathBuf,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_intra_threads() -> usize {
    2
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: crate::model_download::default_pose_model_path(),
            intra_threads: default_intra_threads(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_strategies")]
    pub strategies: Vec<Strategy>,
    #[serde(default = "default_min_pose_confidence")]
    pub min_pose_confidence: f32,
    #[serde(default = "default_visibility_threshold")]
    pub visibility_threshold: f32,
    #[serde(default = "default_max_gap")]
    pub max_interpolation_gap: usize,
    #[serde(default = "default_bone_tolerance")]
    pub bone_length_tolerance: f32,
    #[serde(default = "default_true")]
    pub roi_refinement: bool,
    #[serde(default = "default_true")]
    pub render_overlay: bool,
    #[serde(default)]
    pub weights: ScoreWeights,
}

fn default_strategies() -> Vec<Strategy> {
    Strategy::ALL.to_vec()
}
fn default_min_pose_confidence() -> f32 {
    0.5
}
fn default_visibility_threshold() -> f32 {
    0.5
}
fn default_max_gap() -> usize {
    10
}
fn default_bone_tolerance() -> f32 {
    0.35
}
fn default_true() -> bool {
    true
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            strategies: default_strategies(),
            min_pose_confidence: default_min_pose_confidence(),
            visibility_threshold: default_visibility_threshold(),
            max_interpolation_gap: default_max_gap(),
            bone_length_tolerance: default_bone_tolerance(),
            roi_refinement: true,
            render_overlay: true,
            weights: ScoreWeights::default(),
        }
    }
}

impl AnalysisConfig {
    /// Strategies actually tried per frame for the configured mode.
    pub fn active_strategies(&self) -> Vec<Strategy> {
        match self.mode {
            Mode::Fast => vec![Strategy::Original],
            Mode::Full if self.strategies.is_empty() => vec![Strategy::Original],
            Mode::Full => self.strategies.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct ScoreWeights {
    #[serde(default = "default_w_visibility")]
    pub visibility: f32,
    #[serde(default = "default_w_anatomical")]
    pub anatomical: f32,
    #[serde(default = "default_w_temporal")]
    pub temporal: f32,
    #[serde(default = "default_w_symmetry")]
    pub symmetry: f32,
}

fn default_w_visibility() -> f32 {
    0.4
}
fn default_w_anatomical() -> f32 {
    0.3
}
fn default_w_temporal() -> f32 {
    0.2
}
fn default_w_symmetry() -> f32 {
    0.1
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            visibility: default_w_visibility(),
            anatomical: default_w_anatomical(),
            temporal: default_w_temporal(),
            symmetry: default_w_symmetry(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("{err:?}; falling back to defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.addr, "0.0.0.0:8000");
        assert_eq!(config.limits.max_concurrent_processing, 2);
        assert_eq!(config.limits.max_pending_jobs, 10);
        assert_eq!(config.analysis.strategies.len(), 6);
        assert_eq!(config.analysis.weights, ScoreWeights::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            max_pending_jobs = 3

            [analysis]
            mode = "fast"
            strategies = ["original", "mirrored"]

            [analysis.weights]
            temporal = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_pending_jobs, 3);
        assert_eq!(config.limits.job_ttl_secs, 3600);
        assert_eq!(config.analysis.mode, Mode::Fast);
        assert_eq!(
            config.analysis.strategies,
            vec![Strategy::Original, Strategy::Mirrored]
        );
        assert_eq!(config.analysis.weights.temporal, 0.5);
        assert_eq!(config.analysis.weights.visibility, 0.4);
    }

    #[test]
    fn fast_mode_only_tries_original() {
        let mut analysis = AnalysisConfig::default();
        analysis.mode = Mode::Fast;
        assert_eq!(analysis.active_strategies(), vec![Strategy::Original]);
        analysis.mode = Mode::Full;
        assert_eq!(analysis.active_strategies().len(), 6);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("/nonexistent/bodyscript.toml");
        assert_eq!(config.limits.max_pending_jobs, 10);
    }
}
