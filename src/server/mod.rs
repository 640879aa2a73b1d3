mod handlers;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::jobs::{JobManager, OrtVideoProcessor};
use crate::model_download::ensure_pose_model_ready;

pub use self::handlers::{GalleryEntry, UploadResponse, collect_gallery};

pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];
/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobManager>,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/api/upload", post(handlers::upload))
        .route("/api/process/{job_id}/status", get(handlers::job_status))
        .route("/api/download/{job_id}/{artifact}", get(handlers::download))
        .route("/api/jobs/{job_id}", delete(handlers::delete_job))
        .route("/api/gallery", get(handlers::gallery))
        .route("/health", get(handlers::health))
        .route("/health/live", get(handlers::live))
        .route("/health/ready", get(handlers::ready))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Run the HTTP service until Ctrl-C.
pub async fn serve(config: Config) -> Result<()> {
    let server = &config.server;
    for dir in [&server.upload_dir, &server.output_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let model_path = config.model.path.clone();
    tokio::task::spawn_blocking(move || ensure_pose_model_ready(&model_path, |_evt| {}))
        .await
        .context("model download task failed")??;

    let processor = Arc::new(OrtVideoProcessor::new(
        config.model.clone(),
        config.analysis.clone(),
    ));
    let jobs = JobManager::new(processor, config.limits.clone(), server.output_dir.clone());
    let sweeper = jobs.spawn_sweeper();

    let state = AppState {
        jobs,
        upload_dir: server.upload_dir.clone(),
        max_upload_bytes: server.max_upload_bytes,
    };

    let addr: SocketAddr = server
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", server.addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    sweeper.abort();
    log::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    log::info!("shutdown requested");
}
