//! File upload, rename, enable/disable, delete and indexing status endpoints

use axum::{
    extract::{Multipart, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::catalog::DeleteSummary;
use crate::error::{Error, Result};
use crate::server::state::AppState;
use crate::types::{Actor, BackendSource, DirectoryNode, FileRecord, IndexingStatus, ROOT_PARENT_ID};

/// Response for a multipart upload
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub files: Vec<FileRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<UploadError>,
}

#[derive(Debug, Serialize)]
pub struct UploadError {
    pub file_name: String,
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameFileRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct EnableRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub file_ids: Vec<i64>,
}

/// POST /api/repos/:id/files - Upload files
///
/// Text fields `parent_id` and `source` (`local` | `managed`) must come before the file
/// parts they apply to. Each file is validated on its own; rejected files are reported
/// next to the accepted ones.
pub async fn upload_files(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    actor: Actor,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let mut parent_id = ROOT_PARENT_ID;
    let mut source = BackendSource::Local;
    let mut files = Vec::new();
    let mut errors = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::validation(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "parent_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::validation(format!("Failed to read parent_id: {}", e)))?;
                parent_id = text
                    .trim()
                    .parse()
                    .map_err(|_| Error::validation(format!("Invalid parent_id '{}'", text)))?;
                continue;
            }
            "source" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::validation(format!("Failed to read source: {}", e)))?;
                source = BackendSource::parse(text.trim())
                    .ok_or_else(|| Error::validation(format!("Unknown source '{}'", text)))?;
                continue;
            }
            _ => {}
        }

        let Some(file_name) = field.file_name().map(|s| s.to_string()) else {
            continue;
        };

        let data = match field.bytes().await {
            Ok(d) => d,
            Err(e) => {
                errors.push(UploadError {
                    file_name,
                    error: format!("Failed to read file: {}", e),
                });
                continue;
            }
        };

        match state
            .catalog()
            .upload_file(repo_id, parent_id, &file_name, &data, source, &actor)
            .await
        {
            Ok(record) => files.push(record),
            Err(e) => {
                tracing::warn!("Upload of '{}' rejected: {}", file_name, e);
                errors.push(UploadError {
                    file_name,
                    error: e.to_string(),
                });
            }
        }
    }

    if files.is_empty() && errors.is_empty() {
        return Err(Error::validation("No files in upload"));
    }
    Ok(Json(UploadResponse { files, errors }))
}

/// PUT /api/files/:node_id - Rename a file
pub async fn rename_file(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    actor: Actor,
    Json(request): Json<RenameFileRequest>,
) -> Result<Json<DirectoryNode>> {
    Ok(Json(state.catalog().rename_file(node_id, &request.name, &actor)?))
}

/// PUT /api/files/:node_id/enabled
pub async fn set_enabled(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    actor: Actor,
    Json(request): Json<EnableRequest>,
) -> Result<Json<FileRecord>> {
    Ok(Json(state.catalog().set_file_enabled(node_id, request.enabled, &actor)?))
}

/// DELETE /api/files/:node_id
pub async fn delete_file(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    actor: Actor,
) -> Result<Json<DeleteSummary>> {
    Ok(Json(state.catalog().delete_file(node_id, &actor).await?))
}

/// POST /api/files/status
pub async fn indexing_status(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Vec<IndexingStatus>>> {
    Ok(Json(state.orchestrator().get_indexing_status(&request.file_ids, &actor)?))
}
