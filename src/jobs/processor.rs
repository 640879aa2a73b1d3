use std::{path::Path, sync::Mutex};

use anyhow::{Result, anyhow};

use crate::config::{AnalysisConfig, ModelConfig};
use crate::export::AnalysisSummary;
use crate::pipeline::{Analyzer, OrtPoseEngine};

/// Turns one uploaded video into analysis outputs. Called from a blocking thread; `video_name`
/// is the file name the client uploaded.
pub trait VideoProcessor: Send + Sync + 'static {
    fn process(
        &self,
        input: &Path,
        video_name: &str,
        output_dir: &Path,
        progress: &dyn Fn(usize, usize),
    ) -> Result<AnalysisSummary>;
}

/// ONNX Runtime backed processor. Sessions are pooled so concurrent jobs never share one.
pub struct OrtVideoProcessor {
    model: ModelConfig,
    analyzer: Analyzer,
    engines: Mutex<Vec<OrtPoseEngine>>,
}

impl OrtVideoProcessor {
    pub fn new(model: ModelConfig, analysis: AnalysisConfig) -> Self {
        Self {
            model,
            analyzer: Analyzer::new(analysis),
            engines: Mutex::new(Vec::new()),
        }
    }

    fn checkout(&self) -> Result<OrtPoseEngine> {
        let pooled = self
            .engines
            .lock()
            .map_err(|_| anyhow!("engine pool poisoned"))?
            .pop();
        match pooled {
            Some(engine) => Ok(engine),
            None => OrtPoseEngine::load(&self.model, self.analyzer.config()),
        }
    }

    fn checkin(&self, engine: OrtPoseEngine) {
        if let Ok(mut pool) = self.engines.lock() {
            pool.push(engine);
        }
    }
}

impl VideoProcessor for OrtVideoProcessor {
    fn process(
        &self,
        input: &Path,
        video_name: &str,
        output_dir: &Path,
        progress: &dyn Fn(usize, usize),
    ) -> Result<AnalysisSummary> {
        let mut engine = self.checkout()?;
        let result = self
            .analyzer
            .run(&mut engine, input, video_name, output_dir, progress);
        self.checkin(engine);
        result
    }
}
