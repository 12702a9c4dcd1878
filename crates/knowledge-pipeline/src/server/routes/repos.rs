//! Repository and folder tree endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::catalog::DeleteSummary;
use crate::error::Result;
use crate::server::state::AppState;
use crate::types::{Actor, DirectoryNode, Repository, ROOT_PARENT_ID};

#[derive(Debug, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    #[serde(default = "root_parent")]
    pub parent_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    #[serde(default = "root_parent")]
    pub parent_id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

fn root_parent() -> i64 {
    ROOT_PARENT_ID
}

/// POST /api/repos
pub async fn create_repository(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CreateRepositoryRequest>,
) -> Result<Json<Repository>> {
    Ok(Json(state.catalog().create_repository(&request.name, &actor)?))
}

/// GET /api/repos
pub async fn list_repositories(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<Vec<Repository>>> {
    Ok(Json(state.catalog().list_repositories(&actor)?))
}

/// GET /api/repos/:id
pub async fn get_repository(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
) -> Result<Json<Repository>> {
    Ok(Json(state.catalog().get_repository(repo_id, &actor)?))
}

/// PUT /api/repos/:id
pub async fn rename_repository(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
    Json(request): Json<RenameRequest>,
) -> Result<Json<Repository>> {
    Ok(Json(state.catalog().rename_repository(repo_id, &request.name, &actor)?))
}

/// DELETE /api/repos/:id
pub async fn delete_repository(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
) -> Result<Json<DeleteSummary>> {
    Ok(Json(state.catalog().delete_repository(repo_id, &actor).await?))
}

/// GET /api/repos/:id/tree?parent_id=
pub async fn list_tree(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    Query(query): Query<TreeQuery>,
    actor: Actor,
) -> Result<Json<Vec<DirectoryNode>>> {
    Ok(Json(state.catalog().list_children(repo_id, query.parent_id, &actor)?))
}

/// POST /api/repos/:id/folders
pub async fn create_folder(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
    Json(request): Json<CreateFolderRequest>,
) -> Result<Json<DirectoryNode>> {
    let node = state
        .catalog()
        .create_folder(repo_id, request.parent_id, &request.name, &actor)?;
    Ok(Json(node))
}

/// PUT /api/folders/:id
pub async fn rename_folder(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    actor: Actor,
    Json(request): Json<RenameRequest>,
) -> Result<Json<DirectoryNode>> {
    Ok(Json(state.catalog().rename_folder(node_id, &request.name, &actor)?))
}

/// DELETE /api/folders/:id
pub async fn delete_folder(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    actor: Actor,
) -> Result<Json<DeleteSummary>> {
    Ok(Json(state.catalog().delete_folder(node_id, &actor).await?))
}

/// GET /api/nodes/:id/path
pub async fn path_to_root(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    actor: Actor,
) -> Result<Json<Vec<DirectoryNode>>> {
    Ok(Json(state.catalog().path_to_root(node_id, &actor)?))
}
