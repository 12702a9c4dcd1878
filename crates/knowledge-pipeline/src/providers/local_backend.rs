//! In-process extraction: chunk rows in the knowledge store, vectors beside them

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::LocalBackendConfig;
use crate::error::{Error, Result};
use crate::ingestion::{
    check_size, check_supported, contains_blocked_term, count_characters,
    extract_image_references, TextChunker,
};
use crate::processing::RetryPolicy;
use crate::storage::KnowledgeDb;
use crate::types::{BackendSource, ChunkPage, FileRecord, KnowledgeChunk, ScoredChunk, SliceConfig};

use super::document_store::DocumentStoreProvider;
use super::embedding::EmbeddingProvider;
use super::extraction::{EmbedOutcome, ExtractOutcome, ExtractionBackend};
use super::vector_store::VectorStoreProvider;

/// Local extraction backend
pub struct LocalBackend {
    db: KnowledgeDb,
    documents: Arc<dyn DocumentStoreProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStoreProvider>,
    config: LocalBackendConfig,
    parallel_embeddings: usize,
    retry: RetryPolicy,
}

impl LocalBackend {
    pub fn new(
        db: KnowledgeDb,
        documents: Arc<dyn DocumentStoreProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStoreProvider>,
        config: LocalBackendConfig,
    ) -> Self {
        Self {
            db,
            documents,
            embedder,
            vectors,
            config,
            parallel_embeddings: 4,
            retry: RetryPolicy::none(),
        }
    }

    /// Concurrent chunk embeddings per file
    pub fn with_parallelism(mut self, parallel_embeddings: usize) -> Self {
        self.parallel_embeddings = parallel_embeddings.max(1);
        self
    }

    /// Per-chunk retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn size_limit(&self, file_type: &str) -> u64 {
        match file_type {
            "txt" | "md" => self.config.text_size_limit,
            _ => self.config.other_size_limit,
        }
    }

    async fn load_text(&self, file: &FileRecord) -> Result<String> {
        let bytes = self.documents.get_document(&file.storage_key).await?;
        String::from_utf8(bytes)
            .map_err(|_| Error::backend(format!("'{}' is not valid UTF-8 text", file.name)))
    }

    /// Build a hand-written chunk, applying the same reference and audit rules as extraction
    fn manual_chunk(&self, file: &FileRecord, content: &str) -> Result<KnowledgeChunk> {
        let content = content.trim();
        let chars = content.chars().count();
        if chars == 0 || chars > self.config.max_chunk_length {
            return Err(Error::validation(format!(
                "Chunk must be 1 to {} characters, got {}",
                self.config.max_chunk_length, chars
            )));
        }

        let mut chunk = KnowledgeChunk::new(file.id, &file.uuid, 0, content.to_string());
        chunk.references = extract_image_references(&chunk.content);
        if contains_blocked_term(&chunk.content, &self.config.blocked_terms) {
            chunk.flag_for_audit();
        }
        Ok(chunk)
    }

    /// Vector for a chunk that will be served; flagged chunks get none
    async fn vector_for(&self, chunk: &KnowledgeChunk) -> Result<Option<Vec<f32>>> {
        if chunk.audit_flagged {
            return Ok(None);
        }
        let embedding = self
            .retry
            .run("chunk embedding", || self.embedder.embed(&chunk.content))
            .await?;
        Ok(Some(embedding))
    }

    async fn load_chunk(&self, file: &FileRecord, chunk_id: &str) -> Result<KnowledgeChunk> {
        let id = chunk_id.to_string();
        self.blocking(move |db| db.get_chunk(&id))
            .await?
            .filter(|c| c.file_id == file.id)
            .ok_or_else(|| Error::not_found(format!("Chunk {}", chunk_id)))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(KnowledgeDb) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl ExtractionBackend for LocalBackend {
    fn source(&self) -> BackendSource {
        BackendSource::Local
    }

    fn validate_upload(&self, file_name: &str, file_type: &str, data: &[u8]) -> Result<u64> {
        check_supported(file_type, &self.config.supported_types)?;
        check_size(file_name, data.len() as u64, self.size_limit(file_type))?;

        let text = std::str::from_utf8(data).map_err(|_| {
            Error::validation(format!("'{}' is not valid UTF-8 text", file_name))
        })?;
        Ok(count_characters(text))
    }

    fn validate_slice(&self, file: &FileRecord, config: &SliceConfig) -> Result<()> {
        check_supported(&file.file_type, &self.config.supported_types)?;

        let (min, max) = config.length_range;
        let (allowed_min, allowed_max) = (self.config.min_chunk_length, self.config.max_chunk_length);
        if min < allowed_min || min > max || max > allowed_max {
            return Err(Error::ChunkLengthOutOfRange {
                min,
                max,
                allowed_min,
                allowed_max,
            });
        }
        Ok(())
    }

    async fn extract(&self, file: &FileRecord, config: &SliceConfig) -> Result<ExtractOutcome> {
        let text = self.load_text(file).await?;
        let chunker = TextChunker::new(config)?;

        let chunks: Vec<KnowledgeChunk> = chunker
            .chunk(&text)
            .into_iter()
            .enumerate()
            .map(|(idx, content)| {
                let mut chunk = KnowledgeChunk::new(file.id, &file.uuid, idx as u32, content);
                chunk.references = extract_image_references(&chunk.content);
                if contains_blocked_term(&chunk.content, &self.config.blocked_terms) {
                    chunk.flag_for_audit();
                }
                chunk
            })
            .collect();

        let outcome = ExtractOutcome {
            chunk_count: chunks.len() as u32,
            char_count: chunks.iter().map(|c| u64::from(c.char_count)).sum(),
        };
        let flagged = chunks.iter().filter(|c| c.audit_flagged).count();

        let doc_id = file.uuid.clone();
        self.blocking(move |db| db.replace_chunks(&doc_id, &chunks)).await?;

        tracing::info!(
            "[file {}] Stored {} chunks ({} flagged for audit)",
            file.id,
            outcome.chunk_count,
            flagged
        );
        Ok(outcome)
    }

    async fn embed(&self, file: &FileRecord) -> Result<EmbedOutcome> {
        let doc_id = file.uuid.clone();
        let chunks = self.blocking(move |db| db.list_chunks(&doc_id)).await?;
        if chunks.is_empty() {
            return Err(Error::backend("no chunks to embed"));
        }

        self.vectors.clear_document(&file.uuid).await?;

        let semaphore = Semaphore::new(self.parallel_embeddings);
        let permits = &semaphore;
        let futures = chunks.iter().map(|chunk| async move {
            let _permit = permits
                .acquire()
                .await
                .map_err(|e| Error::Internal(format!("Embedding semaphore closed: {}", e)))?;
            let embedding = self
                .retry
                .run("chunk embedding", || self.embedder.embed(&chunk.content))
                .await?;
            self.vectors.upsert(&chunk.id, &embedding).await
        });

        let mut failed = 0u32;
        for (chunk, result) in chunks.iter().zip(join_all(futures).await) {
            if let Err(e) = result {
                failed += 1;
                tracing::warn!("[file {}] Chunk {} failed to embed: {}", file.id, chunk.chunk_index, e);
            }
        }

        let total = chunks.len() as u32;
        if failed == total {
            return Err(Error::embedding(format!("all {} chunks failed to embed", total)));
        }

        Ok(EmbedOutcome {
            embedded: total - failed,
            failed,
        })
    }

    async fn search(
        &self,
        _repo_id: i64,
        doc_ids: &[String],
        query: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let query_embedding = self.embedder.embed(query).await?;
        let results = self.vectors.search(&query_embedding, top_n, doc_ids).await?;

        Ok(results
            .into_iter()
            .map(|r| ScoredChunk {
                doc_id: r.chunk.doc_id,
                content: r.chunk.content,
                score: r.similarity,
                references: r.chunk.references,
            })
            .collect())
    }

    async fn remove(&self, file: &FileRecord) -> Result<()> {
        let removed = self.vectors.delete_by_document(&file.uuid).await?;
        tracing::debug!("[file {}] Removed {} chunks", file.id, removed);
        Ok(())
    }

    async fn list_chunks(&self, file: &FileRecord, page: u32, page_size: u32) -> Result<ChunkPage> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let offset = (page - 1).saturating_mul(page_size);
        let doc_id = file.uuid.clone();
        let (total, chunks) = self
            .blocking(move |db| Ok((db.count_chunks(&doc_id)?, db.list_chunks_page(&doc_id, offset, page_size)?)))
            .await?;
        Ok(ChunkPage {
            total,
            page,
            page_size,
            chunks,
        })
    }

    async fn add_chunk(&self, file: &FileRecord, content: &str) -> Result<KnowledgeChunk> {
        let chunk = self.manual_chunk(file, content)?;
        let vector = self.vector_for(&chunk).await?;
        let stored = self
            .blocking(move |db| db.append_chunk(&chunk, vector.as_deref()))
            .await?
            .ok_or_else(|| Error::conflict(format!("File {} changed state, please retry", file.id)))?;

        tracing::info!(
            "[file {}] Added chunk {}{}",
            file.id,
            stored.chunk_index,
            if stored.audit_flagged { " (flagged for audit)" } else { "" }
        );
        Ok(stored)
    }

    async fn update_chunk(&self, file: &FileRecord, chunk_id: &str, content: &str) -> Result<KnowledgeChunk> {
        let existing = self.load_chunk(file, chunk_id).await?;
        if existing.content == content.trim() {
            return Ok(existing);
        }

        let fresh = self.manual_chunk(file, content)?;
        let vector = self.vector_for(&fresh).await?;
        let updated = KnowledgeChunk {
            content: fresh.content,
            char_count: fresh.char_count,
            references: fresh.references,
            audit_flagged: fresh.audit_flagged,
            // A chunk that was only off because of the audit comes back once clean
            enabled: !fresh.audit_flagged && (existing.enabled || existing.audit_flagged),
            embedded: vector.is_some(),
            ..existing
        };

        let row = updated.clone();
        let changed = self
            .blocking(move |db| db.update_chunk(&row, vector.as_deref()))
            .await?;
        if !changed {
            return Err(Error::conflict(format!("File {} changed state, please retry", file.id)));
        }
        tracing::info!("[file {}] Updated chunk {}", file.id, updated.chunk_index);
        Ok(updated)
    }

    async fn set_chunk_enabled(&self, file: &FileRecord, chunk_id: &str, enabled: bool) -> Result<KnowledgeChunk> {
        let existing = self.load_chunk(file, chunk_id).await?;
        if enabled && existing.audit_flagged {
            return Err(Error::validation(format!(
                "Chunk {} is flagged for audit and cannot be enabled",
                chunk_id
            )));
        }
        if existing.enabled == enabled {
            return Ok(existing);
        }

        let vector = if enabled && !existing.embedded {
            self.vector_for(&existing).await?
        } else {
            None
        };
        let embedded = existing.embedded || vector.is_some();
        let (id, file_id) = (existing.id.clone(), file.id);
        let changed = self
            .blocking(move |db| db.set_chunk_enabled(&id, file_id, enabled, vector.as_deref()))
            .await?;
        if !changed {
            return Err(Error::conflict(format!("File {} changed state, please retry", file.id)));
        }
        Ok(KnowledgeChunk {
            enabled,
            embedded,
            ..existing
        })
    }

    async fn delete_chunk(&self, file: &FileRecord, chunk_id: &str) -> Result<()> {
        let existing = self.load_chunk(file, chunk_id).await?;
        let file_id = file.id;
        let changed = self
            .blocking(move |db| db.delete_chunk(&existing.id, file_id))
            .await?;
        if !changed {
            return Err(Error::conflict(format!("File {} changed state, please retry", file.id)));
        }
        tracing::info!("[file {}] Deleted chunk {}", file.id, chunk_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.embedder.health_check().await? && self.documents.health_check().await?)
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::hash_embedder::HashEmbedder;
    use crate::providers::local::{LocalDocumentStore, LocalVectorStore};
    use crate::types::{FileStatus, NewFileRecord, TaskStage};
    use tempfile::TempDir;

    /// Fails on any chunk mentioning "poison"
    struct PickyEmbedder(HashEmbedder);

    #[async_trait]
    impl EmbeddingProvider for PickyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("poison") {
                return Err(Error::embedding("rejected"));
            }
            self.0.embed(text).await
        }

        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "picky"
        }
    }

    async fn setup(text: &str, embedder: Arc<dyn EmbeddingProvider>) -> (TempDir, LocalBackend, FileRecord) {
        let dir = tempfile::tempdir().unwrap();
        let db = KnowledgeDb::in_memory().unwrap();
        let documents = Arc::new(LocalDocumentStore::new(dir.path().to_path_buf()).unwrap());
        let stored = documents.store_document("doc1", "txt", text.as_bytes()).await.unwrap();

        let mut file = FileRecord::uploaded(NewFileRecord {
            repo_id: 1,
            owner_uid: "u1".to_string(),
            space_id: None,
            name: "notes.txt".to_string(),
            file_type: "txt".to_string(),
            size: stored.size,
            char_count: 0,
            content_hash: "h".to_string(),
            storage_key: stored.storage_key,
            source: BackendSource::Local,
        });
        file.id = db.insert_file_record(&file).unwrap();

        let backend = LocalBackend::new(
            db.clone(),
            documents,
            embedder,
            Arc::new(LocalVectorStore::new(db)),
            LocalBackendConfig {
                blocked_terms: vec!["classified".to_string()],
                ..LocalBackendConfig::default()
            },
        );
        (dir, backend, file)
    }

    #[tokio::test]
    async fn test_extract_embed_search() {
        let text = "Rust ownership rules keep memory safe.\nBorrowing lets code read without moving.\n\
                    ![arch](http://img/arch.png) the architecture diagram.\nThis line is classified.";
        let (_dir, backend, file) = setup(text, Arc::new(HashEmbedder::new(64))).await;
        let config = SliceConfig::custom(vec!["\n".to_string()], 16, 60);

        let extracted = backend.extract(&file, &config).await.unwrap();
        assert_eq!(extracted.chunk_count, 4);

        let chunks = backend.db.list_chunks(&file.uuid).unwrap();
        assert_eq!(chunks[2].references.len(), 1);
        assert!(chunks[3].audit_flagged);
        assert!(!chunks[0].audit_flagged);

        let embedded = backend.embed(&file).await.unwrap();
        assert_eq!(embedded, EmbedOutcome { embedded: 4, failed: 0 });

        let hits = backend
            .search(1, &[file.uuid.clone()], "borrowing code", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].content.contains("Borrowing"));
    }

    fn mark_embedded(db: &KnowledgeDb, file: &FileRecord) {
        db.begin_stage(file.id, FileStatus::sliceable(), FileStatus::Parsing, TaskStage::Parse, "u1", None)
            .unwrap();
        db.complete_parse(file.id, 0, 0).unwrap();
        db.begin_stage(file.id, FileStatus::embeddable(), FileStatus::Embedding, TaskStage::Embed, "u1", None)
            .unwrap();
        db.complete_embed(file.id, 0).unwrap();
    }

    #[tokio::test]
    async fn test_manual_chunks_follow_audit_rules() {
        let text = "Rust ownership rules keep memory safe.\nBorrowing lets code read without moving.";
        let (_dir, backend, file) = setup(text, Arc::new(HashEmbedder::new(64))).await;
        backend
            .extract(&file, &SliceConfig::custom(vec!["\n".to_string()], 16, 60))
            .await
            .unwrap();
        backend.embed(&file).await.unwrap();
        mark_embedded(&backend.db, &file);

        let added = backend.add_chunk(&file, "  Lifetimes tie references to scopes.  ").await.unwrap();
        assert_eq!(added.chunk_index, 2);
        assert_eq!(added.content, "Lifetimes tie references to scopes.");
        assert!(added.enabled && added.embedded);
        let hits = backend.search(1, &[file.uuid.clone()], "lifetimes scopes", 1).await.unwrap();
        assert!(hits[0].content.starts_with("Lifetimes"));

        let flagged = backend.update_chunk(&file, &added.id, "This is classified now.").await.unwrap();
        assert!(flagged.audit_flagged);
        assert!(!flagged.enabled);
        assert!(matches!(
            backend.set_chunk_enabled(&file, &added.id, true).await,
            Err(Error::Validation(_))
        ));

        let clean = backend.update_chunk(&file, &added.id, "Lifetimes again.").await.unwrap();
        assert!(clean.enabled && !clean.audit_flagged);

        let page = backend.list_chunks(&file, 2, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.chunks.len(), 1);
        assert_eq!(page.chunks[0].id, added.id);

        let first = &backend.list_chunks(&file, 1, 1).await.unwrap().chunks[0];
        let disabled = backend.set_chunk_enabled(&file, &first.id, false).await.unwrap();
        assert!(!disabled.enabled);
        let hits = backend.search(1, &[file.uuid.clone()], "ownership memory", 5).await.unwrap();
        assert!(hits.iter().all(|h| !h.content.contains("ownership")));

        backend.delete_chunk(&file, &added.id).await.unwrap();
        assert!(matches!(
            backend.delete_chunk(&file, &added.id).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(backend.db.get_file_record(file.id).unwrap().unwrap().chunk_count, 2);
        assert!(matches!(
            backend.add_chunk(&file, "").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_chunk_failures_are_counted() {
        let text = "first chunk of fine text here\nthis one carries poison inside\nlast fine chunk of text";
        let embedder = Arc::new(PickyEmbedder(HashEmbedder::new(32)));
        let (_dir, backend, file) = setup(text, embedder).await;

        backend
            .extract(&file, &SliceConfig::custom(vec!["\n".to_string()], 16, 40))
            .await
            .unwrap();
        let outcome = backend.embed(&file).await.unwrap();
        assert_eq!(outcome, EmbedOutcome { embedded: 2, failed: 1 });
    }

    #[tokio::test]
    async fn test_all_chunks_failing_is_an_error() {
        let embedder = Arc::new(PickyEmbedder(HashEmbedder::new(32)));
        let (_dir, backend, file) = setup("poison everywhere in this file", embedder).await;

        backend
            .extract(&file, &SliceConfig::custom(vec![], 16, 100))
            .await
            .unwrap();
        assert!(backend.embed(&file).await.is_err());
    }

    #[tokio::test]
    async fn test_slice_range_enforced() {
        let (_dir, backend, file) = setup("text", Arc::new(HashEmbedder::new(8))).await;

        let err = backend
            .validate_slice(&file, &SliceConfig::custom(vec![], 8, 2000))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ChunkLengthOutOfRange { allowed_min: 16, allowed_max: 1024, .. }
        ));
        assert!(backend
            .validate_slice(&file, &SliceConfig::custom(vec![], 50, 500))
            .is_ok());
    }

    #[tokio::test]
    async fn test_upload_rules() {
        let (_dir, backend, _file) = setup("text", Arc::new(HashEmbedder::new(8))).await;

        assert_eq!(backend.validate_upload("a.txt", "txt", b"ab\ncd").unwrap(), 6);
        assert!(matches!(
            backend.validate_upload("a.pdf", "pdf", b"%PDF"),
            Err(Error::UnsupportedFileType(_))
        ));
        assert!(backend.validate_upload("a.txt", "txt", &[0xff, 0xfe]).is_err());
    }
}
