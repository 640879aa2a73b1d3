use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobError {
    #[error("processing queue is full ({0} jobs pending)")]
    QueueFull(usize),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} has not completed")]
    NotFinished(Uuid),
}

/// Errors surfaced by HTTP handlers, rendered as `{"error": "..."}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("upload exceeds the {0} byte limit")]
    PayloadTooLarge(usize),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Job(JobError::QueueFull(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Job(JobError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Job(JobError::NotFinished(_)) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            log::error!("request failed: {self:?}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_errors_map_to_http_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::from(JobError::QueueFull(10)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::from(JobError::NotFound(id)).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(JobError::NotFinished(id)).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::PayloadTooLarge(1).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
