//! Per-chunk endpoints of an embedded file

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::server::state::AppState;
use crate::types::{Actor, ChunkPage, KnowledgeChunk};

#[derive(Debug, Deserialize)]
pub struct ChunkListQuery {
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn first_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct ChunkContentRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChunkEnableRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ChunkDeleted {
    pub id: String,
}

/// GET /api/files/:node_id/chunks?page=&page_size=
pub async fn list_chunks(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    Query(query): Query<ChunkListQuery>,
    actor: Actor,
) -> Result<Json<ChunkPage>> {
    let page = state
        .catalog()
        .list_file_chunks(node_id, query.page, query.page_size, &actor)
        .await?;
    Ok(Json(page))
}

/// POST /api/files/:node_id/chunks
pub async fn add_chunk(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    actor: Actor,
    Json(request): Json<ChunkContentRequest>,
) -> Result<Json<KnowledgeChunk>> {
    Ok(Json(state.catalog().add_chunk(node_id, &request.content, &actor).await?))
}

/// PUT /api/files/:node_id/chunks/:chunk_id
pub async fn update_chunk(
    State(state): State<AppState>,
    Path((node_id, chunk_id)): Path<(i64, String)>,
    actor: Actor,
    Json(request): Json<ChunkContentRequest>,
) -> Result<Json<KnowledgeChunk>> {
    let chunk = state
        .catalog()
        .update_chunk(node_id, &chunk_id, &request.content, &actor)
        .await?;
    Ok(Json(chunk))
}

/// PUT /api/files/:node_id/chunks/:chunk_id/enabled
pub async fn set_chunk_enabled(
    State(state): State<AppState>,
    Path((node_id, chunk_id)): Path<(i64, String)>,
    actor: Actor,
    Json(request): Json<ChunkEnableRequest>,
) -> Result<Json<KnowledgeChunk>> {
    let chunk = state
        .catalog()
        .set_chunk_enabled(node_id, &chunk_id, request.enabled, &actor)
        .await?;
    Ok(Json(chunk))
}

/// DELETE /api/files/:node_id/chunks/:chunk_id
pub async fn delete_chunk(
    State(state): State<AppState>,
    Path((node_id, chunk_id)): Path<(i64, String)>,
    actor: Actor,
) -> Result<Json<ChunkDeleted>> {
    state.catalog().delete_chunk(node_id, &chunk_id, &actor).await?;
    Ok(Json(ChunkDeleted { id: chunk_id }))
}
