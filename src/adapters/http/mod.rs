//! JSON HTTP front end for the job engine.

mod jobs;

use crate::application::engine::TranscodeEngine;
use crate::application::error::EngineError;
use crate::ports::process::ProcessRunner;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

pub fn router<R>(engine: Arc<TranscodeEngine<R>>) -> Router
where
    R: ProcessRunner + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(jobs::list::<R>).post(jobs::submit::<R>))
        .route("/jobs/:id", get(jobs::status::<R>).delete(jobs::cancel::<R>))
        .with_state(engine)
}

async fn health() -> Json<StatusBody> {
    Json(StatusBody {
        status: "ok",
        message: String::from("running"),
    })
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
    message: String,
}

/// Error response rendered as `{"status":"error","message":...}`.
#[derive(Debug)]
pub struct ApiError(pub String, pub StatusCode);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (message, status) = (self.0, self.1);
        let body = StatusBody {
            status: "error",
            message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::InvalidSource { .. } => StatusCode::BAD_REQUEST,
            EngineError::Probe(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidState { .. } | EngineError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::QueueClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Snapshot { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(err.to_string(), status)
    }
}
