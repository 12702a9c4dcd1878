//! HTTP server for the ingestion pipeline

pub mod routes;
pub mod state;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use state::AppState;

/// Pipeline HTTP Server
pub struct PipelineServer {
    config: PipelineConfig,
    state: AppState,
}

impl PipelineServer {
    /// Create a new server, opening storage and wiring backends
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        let state = AppState::new(config.clone()).await?;
        Ok(Self { config, state })
    }

    /// Wrap existing state
    pub fn with_state(state: AppState) -> Self {
        Self {
            config: state.config().clone(),
            state,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        // CORS layer - must be added first (outermost)
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness))
            .nest("/api", routes::api_routes(self.config.server.max_upload_size))
            .with_state(self.state.clone())
            // Middleware layers (order matters - applied bottom to top)
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(cors)
    }

    /// Start the server
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self
            .address()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;

        let router = self.build_router();

        tracing::info!("Starting pipeline server on http://{}", addr);
        tracing::info!("API overview: http://{}/api/info", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Failed to bind: {}", e)))?;

        axum::serve(listener, router)
            .await
            .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Get the server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.server.host, self.config.server.port)
    }
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Readiness check endpoint; ready once startup recovery has finished
async fn readiness(state: axum::extract::State<AppState>) -> axum::http::StatusCode {
    if state.is_ready() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, BackendSource, ROOT_PARENT_ID};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn server(dir: &TempDir) -> PipelineServer {
        let mut config = PipelineConfig::default();
        config.storage.database_path = dir.path().join("pipeline.db");
        config.storage.documents_dir = dir.path().join("documents");
        config.embeddings.dimensions = 32;
        PipelineServer::new(config).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        json_request("POST", uri, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-user-id", "u1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn bare_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", "u1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_ready_after_flag() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;

        let response = server
            .build_router()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        server.state().set_ready(true);
        let response = server
            .build_router()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_user_header_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/repos")
            .header("content-type", "application/json")
            .body(Body::from(json!({"name": "docs"}).to_string()))
            .unwrap();
        let response = server.build_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"]["type"], "permission_denied");
    }

    #[tokio::test]
    async fn test_error_bodies_carry_kind() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;

        let response = server
            .build_router()
            .oneshot(post_json("/api/repos", json!({"name": "docs"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let repo_id = body_json(response).await["id"].as_i64().unwrap();

        let response = server
            .build_router()
            .oneshot(post_json(
                &format!("/api/repos/{}/hit-test", repo_id),
                json!({"query": "anything"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["error"]["type"], "no_enabled_content");

        let response = server
            .build_router()
            .oneshot(post_json(
                &format!("/api/repos/{}/slice", repo_id),
                json!({"file_ids": [12345], "slice_config": {"type": "default", "length_range": [256, 1024]}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_indexing_status_route() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let actor = Actor::user("u1", None);
        let catalog = server.state().catalog();
        let repo = catalog.create_repository("docs", &actor).unwrap();
        let file = catalog
            .upload_file(repo.id, ROOT_PARENT_ID, "a.txt", b"alpha\nbeta", BackendSource::Local, &actor)
            .await
            .unwrap();

        let response = server
            .build_router()
            .oneshot(post_json("/api/files/status", json!({"file_ids": [file.id, 424242]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let statuses = body.as_array().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["file_id"], file.id);
        assert_eq!(statuses[0]["status"], "uploaded");
        assert_eq!(statuses[0]["enabled"], false);
        assert_eq!(statuses[0]["chunk_count"], 0);
        assert!(statuses[0].get("reason").is_none());
    }

    #[tokio::test]
    async fn test_repository_routes() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let router = server.build_router();

        let response = router
            .clone()
            .oneshot(post_json("/api/repos", json!({"name": "docs"})))
            .await
            .unwrap();
        let repo_id = body_json(response).await["id"].as_i64().unwrap();
        let response = router
            .clone()
            .oneshot(post_json("/api/repos", json!({"name": "docs"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = router
            .clone()
            .oneshot(json_request("PUT", &format!("/api/repos/{}", repo_id), json!({"name": "manuals"})))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["name"], "manuals");

        let response = router.clone().oneshot(bare_request("GET", "/api/repos")).await.unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["name"], "manuals");

        let response = router
            .clone()
            .oneshot(bare_request("DELETE", &format!("/api/repos/{}", repo_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["node_count"], 0);

        let response = router
            .oneshot(bare_request("GET", &format!("/api/repos/{}", repo_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chunk_routes_on_unembedded_file() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let actor = Actor::user("u1", None);
        let catalog = server.state().catalog();
        let repo = catalog.create_repository("docs", &actor).unwrap();
        let file = catalog
            .upload_file(repo.id, ROOT_PARENT_ID, "a.txt", b"alpha\nbeta", BackendSource::Local, &actor)
            .await
            .unwrap();
        let node_id = server.state().db().node_for_file(file.id).unwrap().unwrap().id;

        let response = server
            .build_router()
            .oneshot(bare_request("GET", &format!("/api/files/{}/chunks?page=1&page_size=5", node_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_json(response).await;
        assert_eq!(page["total"], 0);
        assert_eq!(page["page_size"], 5);

        let response = server
            .build_router()
            .oneshot(post_json(
                &format!("/api/files/{}/chunks", node_id),
                json!({"content": "a hand-written chunk"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "validation_error");
    }
}
