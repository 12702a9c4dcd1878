//! Local provider implementations: filesystem document store and SQLite-backed vectors

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::retrieval::similarity::cosine_similarity;
use crate::storage::KnowledgeDb;

use super::document_store::{DocumentStoreProvider, StoredObject};
use super::vector_store::{VectorSearchResult, VectorStoreProvider};

/// Vector store keeping embeddings on the chunk rows
pub struct LocalVectorStore {
    db: KnowledgeDb,
}

impl LocalVectorStore {
    pub fn new(db: KnowledgeDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorStoreProvider for LocalVectorStore {
    async fn upsert(&self, chunk_id: &str, embedding: &[f32]) -> Result<()> {
        let db = self.db.clone();
        let chunk_id = chunk_id.to_string();
        let embedding = embedding.to_vec();
        tokio::task::spawn_blocking(move || db.store_embedding(&chunk_id, &embedding))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn clear_document(&self, doc_id: &str) -> Result<()> {
        let db = self.db.clone();
        let doc_id = doc_id.to_string();
        tokio::task::spawn_blocking(move || db.clear_embeddings(&doc_id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        doc_ids: &[String],
    ) -> Result<Vec<VectorSearchResult>> {
        let db = self.db.clone();
        let query = query_embedding.to_vec();
        let doc_ids = doc_ids.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut results: Vec<VectorSearchResult> = db
                .embedded_chunks(&doc_ids)?
                .into_iter()
                .filter(|(_, embedding)| embedding.len() == query.len())
                .map(|(chunk, embedding)| VectorSearchResult {
                    similarity: cosine_similarity(&query, &embedding),
                    chunk,
                })
                .collect();

            results.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            results.truncate(top_k);
            Ok(results)
        })
        .await
        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn delete_by_document(&self, doc_id: &str) -> Result<usize> {
        let db = self.db.clone();
        let doc_id = doc_id.to_string();
        tokio::task::spawn_blocking(move || db.delete_chunks(&doc_id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    fn name(&self) -> &str {
        "local-sqlite"
    }
}

/// Local document store using filesystem
pub struct LocalDocumentStore {
    /// Directory to store documents
    storage_dir: PathBuf,
}

impl LocalDocumentStore {
    /// Create a new local document store
    pub fn new(storage_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Self { storage_dir })
    }

    /// Resolve a key to a path inside the storage dir
    fn doc_path(&self, storage_key: &str) -> Result<PathBuf> {
        let valid = !storage_key.is_empty()
            && storage_key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
            && !storage_key.starts_with('.');
        if !valid {
            return Err(Error::validation(format!("Invalid storage key '{}'", storage_key)));
        }
        Ok(self.storage_dir.join(storage_key))
    }
}

#[async_trait]
impl DocumentStoreProvider for LocalDocumentStore {
    async fn store_document(
        &self,
        object_id: &str,
        declared_type: &str,
        data: &[u8],
    ) -> Result<StoredObject> {
        let storage_key = format!("{}.{}", object_id, declared_type);
        let path = self.doc_path(&storage_key)?;
        tokio::fs::write(&path, data).await?;

        Ok(StoredObject {
            storage_key,
            size: data.len() as u64,
        })
    }

    async fn get_document(&self, storage_key: &str) -> Result<Vec<u8>> {
        let path = self.doc_path(storage_key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read document {}: {}", storage_key, e)))
    }

    async fn delete_document(&self, storage_key: &str) -> Result<()> {
        let path = self.doc_path(storage_key)?;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.storage_dir.exists())
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KnowledgeChunk;

    #[tokio::test]
    async fn test_document_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path().to_path_buf()).unwrap();

        let stored = store.store_document("abc123", "txt", b"hello").await.unwrap();
        assert_eq!(stored.storage_key, "abc123.txt");
        assert_eq!(stored.size, 5);
        assert_eq!(store.get_document(&stored.storage_key).await.unwrap(), b"hello");

        store.delete_document(&stored.storage_key).await.unwrap();
        assert!(store.get_document(&stored.storage_key).await.is_err());
        store.delete_document(&stored.storage_key).await.unwrap();
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.get_document("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_search_filters_by_document() {
        let db = KnowledgeDb::in_memory().unwrap();
        let a = KnowledgeChunk::new(1, "doc-a", 0, "alpha".to_string());
        let b = KnowledgeChunk::new(2, "doc-b", 0, "beta".to_string());
        db.replace_chunks("doc-a", &[a.clone()]).unwrap();
        db.replace_chunks("doc-b", &[b.clone()]).unwrap();

        let store = LocalVectorStore::new(db);
        store.upsert(&a.id, &[1.0, 0.0]).await.unwrap();
        store.upsert(&b.id, &[1.0, 0.0]).await.unwrap();

        let results = store.search(&[1.0, 0.0], 5, &["doc-b".to_string()]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.doc_id, "doc-b");
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }
}
