//! Extraction backend contract and per-source registry

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{BackendSource, ChunkPage, FileRecord, KnowledgeChunk, ScoredChunk, SliceConfig};

/// What chunking produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub chunk_count: u32,
    /// Characters across all chunks
    pub char_count: u64,
}

/// What embedding produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedOutcome {
    pub embedded: u32,
    /// Chunks left without a vector
    pub failed: u32,
}

/// Performs chunking and vectorization for the files it owns
///
/// Implementations:
/// - `LocalBackend`: chunk rows and vectors in the local store
/// - `ManagedBackend`: external document service over HTTP
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Source tag this backend serves
    fn source(&self) -> BackendSource;

    /// Check an upload against this backend's type and size rules.
    ///
    /// Returns the document's character count (0 when it is not text).
    fn validate_upload(&self, file_name: &str, file_type: &str, data: &[u8]) -> Result<u64>;

    /// Check a resolved slice config for a file
    fn validate_slice(&self, file: &FileRecord, config: &SliceConfig) -> Result<()>;

    /// Split the file into chunks
    async fn extract(&self, file: &FileRecord, config: &SliceConfig) -> Result<ExtractOutcome>;

    /// Vectorize the file's chunks
    async fn embed(&self, file: &FileRecord) -> Result<EmbedOutcome>;

    /// Similarity search over the given documents
    async fn search(
        &self,
        repo_id: i64,
        doc_ids: &[String],
        query: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Forget everything derived from the file
    async fn remove(&self, file: &FileRecord) -> Result<()>;

    /// One page of the file's chunks; `page` starts at 1
    async fn list_chunks(&self, _file: &FileRecord, _page: u32, _page_size: u32) -> Result<ChunkPage> {
        Err(self.chunk_edits_unsupported())
    }

    /// Append a hand-written chunk, searchable right away unless it is flagged
    async fn add_chunk(&self, _file: &FileRecord, _content: &str) -> Result<KnowledgeChunk> {
        Err(self.chunk_edits_unsupported())
    }

    async fn update_chunk(&self, _file: &FileRecord, _chunk_id: &str, _content: &str) -> Result<KnowledgeChunk> {
        Err(self.chunk_edits_unsupported())
    }

    async fn set_chunk_enabled(&self, _file: &FileRecord, _chunk_id: &str, _enabled: bool) -> Result<KnowledgeChunk> {
        Err(self.chunk_edits_unsupported())
    }

    async fn delete_chunk(&self, _file: &FileRecord, _chunk_id: &str) -> Result<()> {
        Err(self.chunk_edits_unsupported())
    }

    /// Check if the backend is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Get backend name for logging
    fn name(&self) -> &str;

    fn chunk_edits_unsupported(&self) -> Error {
        Error::validation(format!("The {} backend does not support chunk editing", self.name()))
    }
}

/// Backends keyed by the source tag carried on file records
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendSource, Arc<dyn ExtractionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ExtractionBackend>) {
        self.backends.insert(backend.source(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn ExtractionBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, source: BackendSource) -> Result<Arc<dyn ExtractionBackend>> {
        self.backends.get(&source).cloned().ok_or_else(|| {
            Error::validation(format!("No {} backend is configured", source.as_str()))
        })
    }

    /// Backend owning a file
    pub fn for_file(&self, file: &FileRecord) -> Result<Arc<dyn ExtractionBackend>> {
        self.get(file.source)
    }

    pub fn sources(&self) -> Vec<BackendSource> {
        self.backends.keys().copied().collect()
    }
}
