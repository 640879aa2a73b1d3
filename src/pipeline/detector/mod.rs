pub mod common;
mod ort;

use crate::types::{Frame, PoseLandmarks};

pub use self::ort::{DetectorConfig, OrtPoseEngine};

/// Single-person pose detector. `Ok(None)` means no confident pose in the frame.
pub trait PoseEngine: Send {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Option<PoseLandmarks>>;
}

impl<E: PoseEngine + ?Sized> PoseEngine for Box<E> {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Option<PoseLandmarks>> {
        (**self).detect(frame)
    }
}
