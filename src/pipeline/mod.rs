pub mod analysis;
pub mod detector;
pub mod interpolate;
pub mod kinematic;
pub mod scoring;
pub mod selector;
pub mod skeleton;
pub mod strategy;

// Re-exports for convenience
pub use analysis::{Analyzer, analyze_frames};
pub use detector::{OrtPoseEngine, PoseEngine};
pub use selector::StrategySelector;
pub use strategy::{Mode, Strategy};
