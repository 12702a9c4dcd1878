//! Managed extraction backend: an external document service over HTTP
//!
//! Every call answers `{code, message, data?}`; a non-zero code fails the call and is
//! never retried. Transport failures and non-2xx statuses go through the retry policy.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ManagedBackendConfig;
use crate::error::{Error, Result};
use crate::ingestion::{check_size, check_supported, count_characters};
use crate::processing::RetryPolicy;
use crate::types::{
    is_image_type, BackendSource, FileRecord, ScoredChunk, SliceConfig, SliceType,
};

use super::extraction::{EmbedOutcome, ExtractOutcome, ExtractionBackend};

#[derive(Debug, Deserialize)]
struct ServiceResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdsRequest<'a> {
    file_ids: Vec<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SplitConfigPayload {
    /// Base64-encoded separators
    chunk_separators: Vec<String>,
    chunk_size: usize,
    min_chunk_size: usize,
    is_split_default: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SplitRequest<'a> {
    file_ids: Vec<&'a str>,
    split_config: SplitConfigPayload,
}

#[derive(Deserialize)]
struct ChunkContent {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    repo_id: i64,
    doc_ids: &'a [String],
    query: &'a str,
    top_n: usize,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    results: Vec<QueryHit>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryHit {
    doc_id: String,
    content: String,
    #[serde(default)]
    score: f32,
}

/// Client for the managed document service
pub struct ManagedBackend {
    client: Client,
    base_url: String,
    config: ManagedBackendConfig,
    retry: RetryPolicy,
}

impl ManagedBackend {
    pub fn new(config: ManagedBackendConfig, retry_base_delay: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::new(config.max_retries, retry_base_delay),
            config,
        })
    }

    /// POST a JSON body and unwrap the service envelope
    async fn post<B, T>(&self, path: &str, body: &B) -> Result<Option<T>>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: ServiceResponse<T> = response.json().await?;
        if parsed.code != 0 {
            return Err(Error::backend(format!(
                "{} returned code {}: {}",
                path, parsed.code, parsed.message
            )));
        }
        Ok(parsed.data)
    }

    async fn fetch_chunks(&self, file_id: &str) -> Result<Vec<ChunkContent>> {
        let url = format!("{}/file/chunks", self.base_url);
        let chunks = self
            .client
            .get(&url)
            .query(&[("fileId", file_id)])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<ChunkContent>>()
            .await?;
        Ok(chunks)
    }

    fn split_payload(config: &SliceConfig) -> SplitConfigPayload {
        let engine = base64::engine::general_purpose::STANDARD;
        SplitConfigPayload {
            chunk_separators: config.separators.iter().map(|s| engine.encode(s)).collect(),
            chunk_size: config.max_len(),
            min_chunk_size: config.min_len(),
            is_split_default: config.slice_type == SliceType::Default,
        }
    }
}

#[async_trait]
impl ExtractionBackend for ManagedBackend {
    fn source(&self) -> BackendSource {
        BackendSource::Managed
    }

    fn validate_upload(&self, file_name: &str, file_type: &str, data: &[u8]) -> Result<u64> {
        check_supported(file_type, &self.config.supported_types)?;

        let limit = if is_image_type(file_type) {
            self.config.image_size_limit
        } else {
            self.config.other_size_limit
        };
        check_size(file_name, data.len() as u64, limit)?;

        if file_type != "txt" {
            return Ok(std::str::from_utf8(data).map(count_characters).unwrap_or(0));
        }

        let text = std::str::from_utf8(data).map_err(|_| {
            Error::validation(format!("'{}' is not valid UTF-8 text", file_name))
        })?;
        let char_count = count_characters(text);
        if char_count > self.config.max_char_count {
            return Err(Error::validation(format!(
                "'{}' has {} characters, limit is {}",
                file_name, char_count, self.config.max_char_count
            )));
        }
        Ok(char_count)
    }

    fn validate_slice(&self, file: &FileRecord, config: &SliceConfig) -> Result<()> {
        check_supported(&file.file_type, &self.config.supported_types)?;
        let (min, max) = config.length_range;
        if min == 0 || min > max {
            return Err(Error::validation(format!(
                "Invalid chunk length range [{}, {}]",
                min, max
            )));
        }
        Ok(())
    }

    async fn extract(&self, file: &FileRecord, config: &SliceConfig) -> Result<ExtractOutcome> {
        let request = SplitRequest {
            file_ids: vec![file.uuid.as_str()],
            split_config: Self::split_payload(config),
        };
        self.retry
            .run("managed split", || {
                self.post::<_, serde_json::Value>("/file/split", &request)
            })
            .await?;

        let chunks = self
            .retry
            .run("managed chunk listing", || self.fetch_chunks(&file.uuid))
            .await?;

        Ok(ExtractOutcome {
            chunk_count: chunks.len() as u32,
            char_count: chunks.iter().map(|c| c.content.chars().count() as u64).sum(),
        })
    }

    async fn embed(&self, file: &FileRecord) -> Result<EmbedOutcome> {
        let request = FileIdsRequest {
            file_ids: vec![file.uuid.as_str()],
        };
        self.retry
            .run("managed embedding", || {
                self.post::<_, serde_json::Value>("/file/embedding", &request)
            })
            .await?;

        Ok(EmbedOutcome {
            embedded: file.chunk_count,
            failed: 0,
        })
    }

    async fn search(
        &self,
        repo_id: i64,
        doc_ids: &[String],
        query: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let request = QueryRequest {
            repo_id,
            doc_ids,
            query,
            top_n,
        };
        let data: Option<QueryData> = self.post("/knowledge/query", &request).await?;

        Ok(data
            .map(|d| d.results)
            .unwrap_or_default()
            .into_iter()
            .map(|hit| ScoredChunk {
                doc_id: hit.doc_id,
                content: hit.content,
                score: hit.score,
                references: Vec::new(),
            })
            .collect())
    }

    async fn remove(&self, file: &FileRecord) -> Result<()> {
        let request = FileIdsRequest {
            file_ids: vec![file.uuid.as_str()],
        };
        self.retry
            .run("managed delete", || {
                self.post::<_, serde_json::Value>("/file/delete", &request)
            })
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.get(&self.base_url).send().await {
            Ok(response) => Ok(!response.status().is_server_error()),
            Err(_) => Ok(false),
        }
    }

    fn name(&self) -> &str {
        "managed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewFileRecord;
    use httpmock::prelude::*;
    use serde_json::json;

    fn backend(url: String, max_retries: u32) -> ManagedBackend {
        let config = ManagedBackendConfig {
            max_retries,
            max_char_count: 10,
            ..ManagedBackendConfig::new(url)
        };
        ManagedBackend::new(config, Duration::from_millis(1)).unwrap()
    }

    fn file() -> FileRecord {
        let mut file = FileRecord::uploaded(NewFileRecord {
            repo_id: 3,
            owner_uid: "u1".to_string(),
            space_id: None,
            name: "report.pdf".to_string(),
            file_type: "pdf".to_string(),
            size: 100,
            char_count: 0,
            content_hash: "h".to_string(),
            storage_key: "k".to_string(),
            source: BackendSource::Managed,
        });
        file.uuid = "f0f0".to_string();
        file
    }

    #[tokio::test]
    async fn test_extract_splits_then_counts_chunks() {
        let server = MockServer::start_async().await;
        let split = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/file/split")
                    .json_body_partial(r#"{"fileIds":["f0f0"],"splitConfig":{"chunkSeparators":["Cg=="],"chunkSize":500,"minChunkSize":50,"isSplitDefault":false}}"#);
                then.status(200).json_body(json!({"code": 0, "message": "ok"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/file/chunks").query_param("fileId", "f0f0");
                then.status(200)
                    .json_body(json!([{"content": "alpha"}, {"content": "beta gamma"}]));
            })
            .await;

        let outcome = backend(server.base_url(), 0)
            .extract(&file(), &SliceConfig::custom(vec!["\n".to_string()], 50, 500))
            .await
            .unwrap();

        split.assert_async().await;
        assert_eq!(outcome, ExtractOutcome { chunk_count: 2, char_count: 15 });
    }

    #[tokio::test]
    async fn test_nonzero_code_is_not_retried() {
        let server = MockServer::start_async().await;
        let embed = server
            .mock_async(|when, then| {
                when.method(POST).path("/file/embedding");
                then.status(200).json_body(json!({"code": 10001, "message": "quota exceeded"}));
            })
            .await;

        let err = backend(server.base_url(), 3).embed(&file()).await.unwrap_err();

        assert!(matches!(err, Error::Backend(ref msg) if msg.contains("quota exceeded")));
        embed.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start_async().await;
        let embed = server
            .mock_async(|when, then| {
                when.method(POST).path("/file/embedding");
                then.status(503);
            })
            .await;

        let result = backend(server.base_url(), 2).embed(&file()).await;

        assert!(matches!(result, Err(Error::Http(_))));
        embed.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn test_query_maps_results() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/knowledge/query")
                    .json_body_partial(r#"{"repoId":3,"topN":2}"#);
                then.status(200).json_body(json!({
                    "code": 0,
                    "message": "ok",
                    "data": {"results": [{"docId": "f0f0", "content": "hit", "score": 0.8}]}
                }));
            })
            .await;

        let hits = backend(server.base_url(), 0)
            .search(3, &["f0f0".to_string()], "question", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "f0f0");
    }

    #[tokio::test]
    async fn test_envelope_without_data() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/knowledge/query");
                then.status(200).json_body(json!({"code": 0, "message": "ok"}));
            })
            .await;

        let hits = backend(server.base_url(), 0)
            .search(3, &["f0f0".to_string()], "question", 2)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_upload_limits() {
        let backend = backend("http://localhost:1".to_string(), 0);

        assert!(backend.validate_upload("a.txt", "txt", b"short").is_ok());
        assert!(matches!(
            backend.validate_upload("a.txt", "txt", b"far too many characters"),
            Err(Error::Validation(_))
        ));
        let big_image = vec![0u8; 6 * 1024 * 1024];
        assert!(backend.validate_upload("a.png", "png", &big_image).is_err());
        assert!(matches!(
            backend.validate_upload("a.exe", "exe", b"MZ"),
            Err(Error::UnsupportedFileType(_))
        ));
    }
}
