//! Hit testing: similarity queries over a repository's enabled files

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::error::{Error, Result};
use crate::providers::{AccessPolicy, BackendRegistry};
use crate::storage::KnowledgeDb;
use crate::types::{Actor, BackendSource, FileRecord, FileStatus, HitChunk, HitTestHistory};

/// Runs hit tests and keeps hit counters and query history
pub struct RetrievalEngine {
    db: KnowledgeDb,
    backends: BackendRegistry,
    access: Arc<dyn AccessPolicy>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        db: KnowledgeDb,
        backends: BackendRegistry,
        access: Arc<dyn AccessPolicy>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            db,
            backends,
            access,
            config,
        }
    }

    /// Query a repository. Fails with `NoEnabledContent` when nothing is searchable, so
    /// callers can tell "nothing indexed" from "nothing matched". Search failures are
    /// returned as they are.
    pub async fn hit_test(
        &self,
        repo_id: i64,
        query: &str,
        top_n: Option<usize>,
        actor: &Actor,
    ) -> Result<Vec<HitChunk>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::validation("Query must not be empty"));
        }
        let top_n = top_n.unwrap_or(self.config.default_top_n);
        if top_n == 0 || top_n > self.config.max_top_n {
            return Err(Error::validation(format!(
                "top_n must be between 1 and {}",
                self.config.max_top_n
            )));
        }

        let repo = self
            .db
            .get_repository(repo_id)?
            .ok_or_else(|| Error::not_found(format!("Repository {}", repo_id)))?;
        self.access.check_repository(actor, &repo)?;

        let files: Vec<FileRecord> = self
            .db
            .list_repo_files(repo_id)?
            .into_iter()
            .filter(|f| f.enabled && f.status == FileStatus::EmbeddingSucceeded && f.chunk_count > 0)
            .collect();
        if files.is_empty() {
            return Err(Error::NoEnabledContent(repo_id));
        }

        let mut by_source: HashMap<BackendSource, Vec<String>> = HashMap::new();
        for file in &files {
            by_source.entry(file.source).or_default().push(file.uuid.clone());
        }
        let by_doc: HashMap<&str, &FileRecord> = files.iter().map(|f| (f.uuid.as_str(), f)).collect();

        let mut hits = Vec::new();
        for (source, doc_ids) in &by_source {
            let backend = self.backends.get(*source)?;
            for scored in backend.search(repo_id, doc_ids, query, top_n).await? {
                // Backends may return documents that were disabled after indexing
                let Some(file) = by_doc.get(scored.doc_id.as_str()) else {
                    continue;
                };
                hits.push(HitChunk {
                    file_id: file.id,
                    file_name: file.name.clone(),
                    doc_id: scored.doc_id,
                    content: scored.content,
                    score: scored.score,
                    references: scored.references,
                });
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_n);

        let hit_files: Vec<i64> = hits
            .iter()
            .map(|h| h.file_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.db
            .record_hit_test(repo_id, &actor.user_id, query, &hit_files)?;

        tracing::info!(
            "Hit test on repository {}: {} chunks from {} files",
            repo_id,
            hits.len(),
            hit_files.len()
        );
        Ok(hits)
    }

    /// The caller's recent queries against a repository, newest first
    pub fn hit_history(&self, repo_id: i64, actor: &Actor, limit: usize) -> Result<Vec<HitTestHistory>> {
        let repo = self
            .db
            .get_repository(repo_id)?
            .ok_or_else(|| Error::not_found(format!("Repository {}", repo_id)))?;
        self.access.check_repository(actor, &repo)?;
        self.db.list_hit_history(repo_id, &actor.user_id, limit.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        AllowAllPolicy, EmbedOutcome, ExtractOutcome, ExtractionBackend,
    };
    use crate::storage::database::tests::sample_file;
    use crate::types::{ScoredChunk, SliceConfig, TaskStage};
    use async_trait::async_trait;

    /// Returns two chunks per indexed document
    struct EchoBackend;

    #[async_trait]
    impl ExtractionBackend for EchoBackend {
        fn source(&self) -> BackendSource {
            BackendSource::Local
        }

        fn validate_upload(&self, _: &str, _: &str, _: &[u8]) -> Result<u64> {
            Ok(0)
        }

        fn validate_slice(&self, _: &FileRecord, _: &SliceConfig) -> Result<()> {
            Ok(())
        }

        async fn extract(&self, _: &FileRecord, _: &SliceConfig) -> Result<ExtractOutcome> {
            Ok(ExtractOutcome { chunk_count: 2, char_count: 10 })
        }

        async fn embed(&self, _: &FileRecord) -> Result<EmbedOutcome> {
            Ok(EmbedOutcome { embedded: 2, failed: 0 })
        }

        async fn search(&self, _: i64, doc_ids: &[String], query: &str, _: usize) -> Result<Vec<ScoredChunk>> {
            Ok(doc_ids
                .iter()
                .flat_map(|doc| {
                    (0..2).map(move |i| ScoredChunk {
                        doc_id: doc.clone(),
                        content: format!("{} #{}", query, i),
                        score: 0.5 - i as f32 * 0.1,
                        references: Vec::new(),
                    })
                })
                .collect())
        }

        async fn remove(&self, _: &FileRecord) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn engine(db: &KnowledgeDb) -> RetrievalEngine {
        RetrievalEngine::new(
            db.clone(),
            BackendRegistry::new().with(Arc::new(EchoBackend)),
            Arc::new(AllowAllPolicy),
            RetrievalConfig::default(),
        )
    }

    fn embedded_file(db: &KnowledgeDb, repo_id: i64, name: &str) -> FileRecord {
        let file = sample_file(db, repo_id, name);
        db.insert_node(repo_id, -1, name, Some(file.id), true).unwrap();
        db.begin_stage(file.id, &[FileStatus::Uploaded], FileStatus::Parsing, TaskStage::Parse, "u1", None)
            .unwrap();
        db.complete_parse(file.id, 2, 10).unwrap();
        db.begin_stage(file.id, FileStatus::embeddable(), FileStatus::Embedding, TaskStage::Embed, "u1", None)
            .unwrap();
        db.complete_embed(file.id, 0).unwrap();
        file
    }

    #[tokio::test]
    async fn test_no_enabled_content_is_distinct() {
        let db = KnowledgeDb::in_memory().unwrap();
        let repo = db.insert_repository("docs", "u1", None).unwrap();
        sample_file(&db, repo.id, "draft.txt");

        let err = engine(&db)
            .hit_test(repo.id, "anything", Some(3), &Actor::user("u1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEnabledContent(id) if id == repo.id));
    }

    #[tokio::test]
    async fn test_hit_counted_once_per_file() {
        let db = KnowledgeDb::in_memory().unwrap();
        let repo = db.insert_repository("docs", "u1", None).unwrap();
        let file = embedded_file(&db, repo.id, "guide.txt");
        let actor = Actor::user("u1", None);

        let hits = engine(&db).hit_test(repo.id, "setup", Some(3), &actor).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.file_id == file.id));
        assert!(hits[0].score >= hits[1].score);

        let node = db.node_for_file(file.id).unwrap().unwrap();
        assert_eq!(node.hit_count, 1);

        let history = engine(&db).hit_history(repo.id, &actor, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query, "setup");
    }

    #[tokio::test]
    async fn test_disabled_files_excluded() {
        let db = KnowledgeDb::in_memory().unwrap();
        let repo = db.insert_repository("docs", "u1", None).unwrap();
        let file = embedded_file(&db, repo.id, "guide.txt");
        db.set_file_enabled(file.id, false).unwrap();

        let err = engine(&db)
            .hit_test(repo.id, "setup", None, &Actor::user("u1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEnabledContent(_)));
    }

    #[tokio::test]
    async fn test_top_n_bounds() {
        let db = KnowledgeDb::in_memory().unwrap();
        let repo = db.insert_repository("docs", "u1", None).unwrap();
        let actor = Actor::user("u1", None);

        assert!(matches!(
            engine(&db).hit_test(repo.id, "q", Some(0), &actor).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine(&db).hit_test(repo.id, "q", Some(21), &actor).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine(&db).hit_test(repo.id, "  ", None, &actor).await,
            Err(Error::Validation(_))
        ));
    }
}
