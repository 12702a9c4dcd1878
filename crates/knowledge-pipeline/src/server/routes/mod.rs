//! API routes for the pipeline server

pub mod chunks;
pub mod files;
pub mod hit_test;
pub mod pipeline;
pub mod repos;

use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts},
    http::request::Parts,
    routing::{get, post, put},
    Router,
};

use crate::error::{Error, Result};
use crate::server::state::AppState;
use crate::types::Actor;

/// Header carrying the caller's user id
pub const USER_HEADER: &str = "x-user-id";
/// Optional header carrying the caller's space id
pub const SPACE_HEADER: &str = "x-space-id";

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Repositories and the folder tree
        .route(
            "/repos",
            get(repos::list_repositories).post(repos::create_repository),
        )
        .route(
            "/repos/:id",
            get(repos::get_repository)
                .put(repos::rename_repository)
                .delete(repos::delete_repository),
        )
        .route("/repos/:id/tree", get(repos::list_tree))
        .route("/repos/:id/folders", post(repos::create_folder))
        .route(
            "/folders/:id",
            put(repos::rename_folder).delete(repos::delete_folder),
        )
        .route("/nodes/:id/path", get(repos::path_to_root))
        // Files - with larger body limit for uploads
        .route(
            "/repos/:id/files",
            post(files::upload_files).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route(
            "/files/:node_id",
            put(files::rename_file).delete(files::delete_file),
        )
        .route("/files/:node_id/enabled", put(files::set_enabled))
        .route("/files/status", post(files::indexing_status))
        // Chunks of an embedded file
        .route(
            "/files/:node_id/chunks",
            get(chunks::list_chunks).post(chunks::add_chunk),
        )
        .route(
            "/files/:node_id/chunks/:chunk_id",
            put(chunks::update_chunk).delete(chunks::delete_chunk),
        )
        .route("/files/:node_id/chunks/:chunk_id/enabled", put(chunks::set_chunk_enabled))
        // Pipeline stages
        .route("/repos/:id/slice", post(pipeline::slice_files))
        .route("/repos/:id/embed", post(pipeline::embed_files))
        .route("/repos/:id/retry", post(pipeline::retry_files))
        // Retrieval
        .route("/repos/:id/hit-test", post(hit_test::hit_test))
        .route("/repos/:id/hit-history", get(hit_test::hit_history))
        // Info
        .route("/info", get(info))
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::PermissionDenied(format!("missing {} header", USER_HEADER)))?;

        let space_id = match parts.headers.get(SPACE_HEADER) {
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .ok_or_else(|| Error::validation(format!("invalid {} header", SPACE_HEADER)))?,
            ),
            None => None,
        };

        Ok(Actor::user(user_id, space_id))
    }
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "knowledge-pipeline",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Document ingestion pipeline with resumable slicing, embedding and hit testing",
        "endpoints": {
            "GET /api/repos": "List repositories",
            "POST /api/repos": "Create a repository",
            "GET /api/repos/:id": "Get a repository",
            "PUT /api/repos/:id": "Rename a repository",
            "DELETE /api/repos/:id": "Delete a repository and all of its files",
            "GET /api/repos/:id/tree?parent_id=": "List visible children of a folder",
            "POST /api/repos/:id/folders": "Create a folder",
            "PUT /api/folders/:id": "Rename a folder",
            "DELETE /api/folders/:id": "Delete a folder and everything below it",
            "GET /api/nodes/:id/path": "Breadcrumb for a node",
            "POST /api/repos/:id/files": "Upload files (multipart)",
            "PUT /api/files/:node_id": "Rename a file",
            "PUT /api/files/:node_id/enabled": "Enable or disable a file for hit tests",
            "DELETE /api/files/:node_id": "Delete a file",
            "POST /api/files/status": "Indexing status of files",
            "GET /api/files/:node_id/chunks?page=&page_size=": "List a file's chunks",
            "POST /api/files/:node_id/chunks": "Add a chunk to an embedded file",
            "PUT /api/files/:node_id/chunks/:chunk_id": "Edit a chunk",
            "PUT /api/files/:node_id/chunks/:chunk_id/enabled": "Enable or disable a chunk",
            "DELETE /api/files/:node_id/chunks/:chunk_id": "Delete a chunk",
            "POST /api/repos/:id/slice": "Slice files into chunks",
            "POST /api/repos/:id/embed": "Embed sliced files",
            "POST /api/repos/:id/retry": "Retry failed files",
            "POST /api/repos/:id/hit-test": "Query a repository",
            "GET /api/repos/:id/hit-history": "Recent hit-test queries"
        },
        "headers": {
            "x-user-id": "Caller user id (required)",
            "x-space-id": "Caller space id (optional)"
        }
    }))
}
