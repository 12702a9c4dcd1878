//! Slice, embed and retry endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::error::Result;
use crate::server::state::AppState;
use crate::types::{Actor, EmbedDispatch, RetryOutcome, SliceConfig, SliceOutcome};

#[derive(Debug, Deserialize)]
pub struct SliceRequest {
    pub file_ids: Vec<i64>,
    pub slice_config: SliceConfig,
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub file_ids: Vec<i64>,
    /// Return once workers are dispatched instead of waiting for them
    #[serde(default = "default_background")]
    pub background: bool,
}

fn default_background() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub file_ids: Vec<i64>,
    #[serde(default)]
    pub slice_config: Option<SliceConfig>,
}

/// POST /api/repos/:id/slice - Slice files; waits for the workers
pub async fn slice_files(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
    Json(request): Json<SliceRequest>,
) -> Result<Json<SliceOutcome>> {
    let outcome = state
        .orchestrator()
        .slice_files(repo_id, &request.file_ids, &request.slice_config, &actor)
        .await?;
    Ok(Json(outcome))
}

/// POST /api/repos/:id/embed
pub async fn embed_files(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<EmbedDispatch>> {
    let dispatch = state
        .orchestrator()
        .embed_files(repo_id, &request.file_ids, request.background, &actor)
        .await?;
    Ok(Json(dispatch))
}

/// POST /api/repos/:id/retry
pub async fn retry_files(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
    Json(request): Json<RetryRequest>,
) -> Result<Json<RetryOutcome>> {
    let outcome = state
        .orchestrator()
        .retry(repo_id, &request.file_ids, request.slice_config.as_ref(), &actor)
        .await?;
    Ok(Json(outcome))
}
