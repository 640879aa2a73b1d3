use std::{fs, path::Path};

use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path as UrlPath, State,
        multipart::{Field, MultipartError},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{ALLOWED_EXTENSIONS, AppState};
use crate::error::{ApiError, JobError};
use crate::export::{AnalysisSummary, CSV_FILE, OVERLAY_FILE, SUMMARY_FILE, read_summary};
use crate::jobs::{Job, JobId, JobStatus};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GalleryEntry {
    pub job_id: String,
    pub completed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: AnalysisSummary,
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("job {raw} not found")))
}

fn multipart_error(err: MultipartError, limit: usize) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(limit)
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

/// File name without any directory parts, and its lowercased extension if it is a video.
fn validate_filename(raw: &str) -> Result<(String, String), ApiError> {
    let name = Path::new(raw)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::BadRequest("uploaded file has no name".to_string()))?;
    let ext = Path::new(&name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| ALLOWED_EXTENSIONS.contains(&e.as_str()))
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "unsupported file type; expected one of {}",
                ALLOWED_EXTENSIONS.join(", ")
            ))
        })?;
    Ok((name, ext))
}

async fn save_field(mut field: Field<'_>, path: &Path, limit: usize) -> Result<usize, ApiError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    let mut written = 0usize;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| multipart_error(err, limit))?
    {
        written += chunk.len();
        if written > limit {
            return Err(ApiError::PayloadTooLarge(limit));
        }
        file.write_all(&chunk)
            .await
            .map_err(|err| ApiError::Internal(err.into()))?;
    }
    file.flush()
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(written)
}

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    if !state.jobs.has_capacity() {
        return Err(JobError::QueueFull(state.jobs.pending_count()).into());
    }
    let limit = state.max_upload_bytes;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(err, limit))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let (filename, ext) = validate_filename(field.file_name().unwrap_or_default())?;

        tokio::fs::create_dir_all(&state.upload_dir)
            .await
            .map_err(|err| ApiError::Internal(err.into()))?;
        let path = state
            .upload_dir
            .join(format!("{}.{ext}", Uuid::new_v4()));

        let submitted = match save_field(field, &path, limit).await {
            Ok(0) => Err(ApiError::BadRequest("uploaded file is empty".to_string())),
            Ok(bytes) => {
                log::info!("received {filename} ({bytes} bytes)");
                state
                    .jobs
                    .submit(filename.clone(), path.clone())
                    .map_err(ApiError::from)
            }
            Err(err) => Err(err),
        };

        return match submitted {
            Ok(job_id) => Ok(Json(UploadResponse {
                job_id,
                status: JobStatus::Queued,
                message: format!("{filename} queued for processing"),
            })),
            Err(err) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(err)
            }
        };
    }

    Err(ApiError::BadRequest("missing multipart field `file`".to_string()))
}

pub async fn job_status(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_job_id(&job_id)?;
    Ok(Json(state.jobs.get(id)?))
}

fn artifact(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        "csv" => Some((CSV_FILE, "text/csv")),
        "summary" => Some((SUMMARY_FILE, "application/json")),
        "video" => Some((OVERLAY_FILE, "video/mp4")),
        _ => None,
    }
}

pub async fn download(
    State(state): State<AppState>,
    UrlPath((job_id, kind)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&job_id)?;
    let (file_name, content_type) =
        artifact(&kind).ok_or_else(|| ApiError::NotFound(format!("unknown artifact {kind}")))?;
    let path = state.jobs.artifact_path(id, file_name)?;

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!(
                "{file_name} not available for job {id}"
            )));
        }
        Err(err) => return Err(ApiError::Internal(err.into())),
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{id}_{file_name}\""),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

pub async fn delete_job(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_job_id(&job_id)?;
    let jobs = state.jobs.clone();
    tokio::task::spawn_blocking(move || jobs.remove(id))
        .await
        .map_err(|err| ApiError::Internal(err.into()))??;
    Ok(StatusCode::NO_CONTENT)
}

/// Completed analyses found on disk under `output_root`, newest first.
pub fn collect_gallery(output_root: &Path) -> Vec<GalleryEntry> {
    let Ok(entries) = fs::read_dir(output_root) else {
        return Vec::new();
    };

    let mut gallery: Vec<GalleryEntry> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|dir| dir.is_dir())
        .filter_map(|dir| gallery_entry(&dir))
        .collect();
    gallery.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    gallery
}

fn gallery_entry(dir: &Path) -> Option<GalleryEntry> {
    let path = dir.join(SUMMARY_FILE);
    let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
    let summary = match read_summary(&path) {
        Ok(summary) => summary,
        Err(err) => {
            log::warn!("skipping gallery entry {}: {err:?}", dir.display());
            return None;
        }
    };
    Some(GalleryEntry {
        job_id: dir.file_name()?.to_string_lossy().into_owned(),
        completed_at: DateTime::<Utc>::from(modified),
        summary,
    })
}

pub async fn gallery(State(state): State<AppState>) -> Result<Json<Vec<GalleryEntry>>, ApiError> {
    let root = state.jobs.output_root().to_path_buf();
    let entries = tokio::task::spawn_blocking(move || collect_gallery(&root))
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(Json(entries))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_jobs": state.jobs.active_count(),
        "pending_jobs": state.jobs.pending_count(),
    }))
}

pub async fn live() -> &'static str {
    "ok"
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.jobs.has_capacity() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "busy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::write_summary;
    use crate::pipeline::Mode;

    #[test]
    fn filenames_are_stripped_and_checked() {
        assert_eq!(
            validate_filename("../../etc/clip.MP4").unwrap(),
            ("clip.MP4".to_string(), "mp4".to_string())
        );
        assert!(validate_filename("notes.txt").is_err());
        assert!(validate_filename("noext").is_err());
        assert!(validate_filename("").is_err());
    }

    #[test]
    fn gallery_skips_dirs_without_summary() {
        let root = tempfile::tempdir().unwrap();
        let done = root.path().join("job-a");
        fs::create_dir_all(&done).unwrap();
        fs::create_dir_all(root.path().join("job-b")).unwrap();
        fs::write(root.path().join("job-c"), b"not a dir").unwrap();
        let summary = AnalysisSummary::from_frames("a.mp4", 30.0, Mode::Full, &[]);
        write_summary(&done.join(SUMMARY_FILE), &summary).unwrap();

        let gallery = collect_gallery(root.path());
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].job_id, "job-a");
        assert_eq!(gallery[0].summary.video, "a.mp4");
    }

    #[test]
    fn missing_root_gives_empty_gallery() {
        assert!(collect_gallery(Path::new("/nonexistent/outputs")).is_empty());
    }
}
