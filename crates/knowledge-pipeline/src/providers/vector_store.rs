//! Vector store provider trait for storing and searching chunk embeddings

use async_trait::async_trait;
use crate::error::Result;
use crate::types::KnowledgeChunk;

/// Search result from vector store
#[derive(Debug, Clone)]
pub struct VectorSearchResult {
    /// The matched chunk
    pub chunk: KnowledgeChunk,
    /// Cosine similarity, higher is more similar
    pub similarity: f32,
}

/// Trait for vector storage and similarity search
///
/// Implementations:
/// - `LocalVectorStore`: vectors kept on chunk rows, brute-force cosine search
#[async_trait]
pub trait VectorStoreProvider: Send + Sync {
    /// Attach an embedding to a stored chunk
    async fn upsert(&self, chunk_id: &str, embedding: &[f32]) -> Result<()>;

    /// Drop every vector of a document, keeping its chunks
    async fn clear_document(&self, doc_id: &str) -> Result<()>;

    /// Search for similar chunks, restricted to the given documents
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        doc_ids: &[String],
    ) -> Result<Vec<VectorSearchResult>>;

    /// Delete all chunks and vectors of a document
    async fn delete_by_document(&self, doc_id: &str) -> Result<usize>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
