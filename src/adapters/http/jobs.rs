use super::ApiError;
use crate::application::engine::TranscodeEngine;
use crate::domain::jobs::{JobFilter, JobId, JobView, SubmissionResult};
use crate::ports::process::ProcessRunner;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

type Engine<R> = State<Arc<TranscodeEngine<R>>>;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub path: PathBuf,
}

pub async fn submit<R: ProcessRunner + 'static>(
    State(engine): Engine<R>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmissionResult>), ApiError> {
    let result = engine.submit(&request.path).await?;
    let status = if result.transcoded {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

pub async fn list<R: ProcessRunner + 'static>(
    State(engine): Engine<R>,
    Query(filter): Query<JobFilter>,
) -> Json<Vec<JobView>> {
    Json(engine.list(&filter))
}

pub async fn status<R: ProcessRunner + 'static>(
    State(engine): Engine<R>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(engine.status(&id)?))
}

pub async fn cancel<R: ProcessRunner + 'static>(
    State(engine): Engine<R>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(engine.cancel(&id).await?))
}

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(format!("invalid job id: {}", raw), StatusCode::BAD_REQUEST))
}
