pub mod config;
pub mod error;
pub mod export;
pub mod jobs;
pub mod landmarks;
pub mod model_download;
pub mod pipeline;
pub mod server;
pub mod types;
pub mod video;
