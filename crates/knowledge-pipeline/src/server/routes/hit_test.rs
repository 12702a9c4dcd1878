//! Hit test endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::server::state::AppState;
use crate::types::{Actor, HitChunk, HitTestHistory};

#[derive(Debug, Deserialize)]
pub struct HitTestRequest {
    pub query: String,
    #[serde(default)]
    pub top_n: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HitTestResponse {
    pub query: String,
    pub chunks: Vec<HitChunk>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// POST /api/repos/:id/hit-test
pub async fn hit_test(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
    Json(request): Json<HitTestRequest>,
) -> Result<Json<HitTestResponse>> {
    let chunks = state
        .retrieval()
        .hit_test(repo_id, &request.query, request.top_n, &actor)
        .await?;
    Ok(Json(HitTestResponse {
        query: request.query,
        chunks,
    }))
}

/// GET /api/repos/:id/hit-history?limit=
pub async fn hit_history(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
    actor: Actor,
) -> Result<Json<Vec<HitTestHistory>>> {
    Ok(Json(state.retrieval().hit_history(repo_id, &actor, query.limit)?))
}
