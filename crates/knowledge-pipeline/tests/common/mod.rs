//! Shared harness for pipeline integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use knowledge_pipeline::config::{LocalBackendConfig, ProcessingConfig, RetrievalConfig, SlicingConfig};
use knowledge_pipeline::error::{Error, Result};
use knowledge_pipeline::providers::{
    AllowAllPolicy, BackendRegistry, DocumentStoreProvider, EmbedOutcome, ExtractOutcome,
    ExtractionBackend, HashEmbedder, LocalBackend, LocalDocumentStore, LocalVectorStore,
};
use knowledge_pipeline::types::{
    Actor, BackendSource, ChunkPage, FileRecord, FileStatus, IndexingStatus, KnowledgeChunk,
    ScoredChunk, SliceConfig, ROOT_PARENT_ID,
};
use knowledge_pipeline::{Catalog, KnowledgeDb, PipelineOrchestrator, RetrievalEngine};

/// Holds backend calls until the test opens it; starts open
pub struct Gate {
    open: AtomicBool,
    opened: Notify,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            opened: Notify::new(),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.opened.notify_waiters();
    }

    async fn pass(&self) {
        loop {
            let opened = self.opened.notified();
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            opened.await;
        }
    }
}

/// Local backend whose stages can be told to fail for chosen file names, or held at a gate
pub struct ScriptedBackend {
    inner: LocalBackend,
    fail_extract: Mutex<HashSet<String>>,
    fail_embed: Mutex<HashSet<String>>,
    pub extract_gate: Gate,
    pub embed_gate: Gate,
}

impl ScriptedBackend {
    pub fn fail_extract(&self, file_name: &str) {
        self.fail_extract.lock().insert(file_name.to_string());
    }

    pub fn fail_embed(&self, file_name: &str) {
        self.fail_embed.lock().insert(file_name.to_string());
    }

    pub fn heal(&self) {
        self.fail_extract.lock().clear();
        self.fail_embed.lock().clear();
    }
}

#[async_trait]
impl ExtractionBackend for ScriptedBackend {
    fn source(&self) -> BackendSource {
        BackendSource::Local
    }

    fn validate_upload(&self, file_name: &str, file_type: &str, data: &[u8]) -> Result<u64> {
        self.inner.validate_upload(file_name, file_type, data)
    }

    fn validate_slice(&self, file: &FileRecord, config: &SliceConfig) -> Result<()> {
        self.inner.validate_slice(file, config)
    }

    async fn extract(&self, file: &FileRecord, config: &SliceConfig) -> Result<ExtractOutcome> {
        self.extract_gate.pass().await;
        if self.fail_extract.lock().contains(&file.name) {
            return Err(Error::backend("scripted extraction failure"));
        }
        self.inner.extract(file, config).await
    }

    async fn embed(&self, file: &FileRecord) -> Result<EmbedOutcome> {
        self.embed_gate.pass().await;
        if self.fail_embed.lock().contains(&file.name) {
            return Err(Error::embedding("scripted embedding failure"));
        }
        self.inner.embed(file).await
    }

    async fn search(
        &self,
        repo_id: i64,
        doc_ids: &[String],
        query: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        self.inner.search(repo_id, doc_ids, query, top_n).await
    }

    async fn remove(&self, file: &FileRecord) -> Result<()> {
        self.inner.remove(file).await
    }

    async fn list_chunks(&self, file: &FileRecord, page: u32, page_size: u32) -> Result<ChunkPage> {
        self.inner.list_chunks(file, page, page_size).await
    }

    async fn add_chunk(&self, file: &FileRecord, content: &str) -> Result<KnowledgeChunk> {
        self.inner.add_chunk(file, content).await
    }

    async fn update_chunk(&self, file: &FileRecord, chunk_id: &str, content: &str) -> Result<KnowledgeChunk> {
        self.inner.update_chunk(file, chunk_id, content).await
    }

    async fn set_chunk_enabled(&self, file: &FileRecord, chunk_id: &str, enabled: bool) -> Result<KnowledgeChunk> {
        self.inner.set_chunk_enabled(file, chunk_id, enabled).await
    }

    async fn delete_chunk(&self, file: &FileRecord, chunk_id: &str) -> Result<()> {
        self.inner.delete_chunk(file, chunk_id).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }

    fn name(&self) -> &str {
        "scripted-local"
    }
}

/// A repository wired to a tempdir-backed local stack
pub struct Harness {
    _dir: TempDir,
    pub db: KnowledgeDb,
    pub backend: Arc<ScriptedBackend>,
    pub orchestrator: PipelineOrchestrator,
    pub catalog: Catalog,
    pub retrieval: RetrievalEngine,
    pub actor: Actor,
    pub repo_id: i64,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = KnowledgeDb::new(dir.path().join("pipeline.db")).unwrap();
        let documents: Arc<dyn DocumentStoreProvider> =
            Arc::new(LocalDocumentStore::new(dir.path().join("documents")).unwrap());

        let local = LocalBackend::new(
            db.clone(),
            documents.clone(),
            Arc::new(HashEmbedder::new(64)),
            Arc::new(LocalVectorStore::new(db.clone())),
            LocalBackendConfig::default(),
        )
        .with_parallelism(2);
        let backend = Arc::new(ScriptedBackend {
            inner: local,
            fail_extract: Mutex::new(HashSet::new()),
            fail_embed: Mutex::new(HashSet::new()),
            extract_gate: Gate::new(),
            embed_gate: Gate::new(),
        });

        let backends = BackendRegistry::new().with(backend.clone());
        let access = Arc::new(AllowAllPolicy);
        let processing = ProcessingConfig {
            wait_initial_ms: 10,
            wait_max_ms: 50,
            retry_base_delay_ms: 1,
        };

        let orchestrator = PipelineOrchestrator::new(
            db.clone(),
            backends.clone(),
            access.clone(),
            SlicingConfig::default(),
            processing,
        );
        let catalog = Catalog::new(db.clone(), backends.clone(), documents, access.clone());
        let retrieval = RetrievalEngine::new(db.clone(), backends, access, RetrievalConfig::default());

        let actor = Actor::user("u1", None);
        let repo_id = catalog.create_repository("handbook", &actor).unwrap().id;

        Self {
            _dir: dir,
            db,
            backend,
            orchestrator,
            catalog,
            retrieval,
            actor,
            repo_id,
        }
    }

    pub async fn upload(&self, name: &str, text: &str) -> FileRecord {
        self.catalog
            .upload_file(
                self.repo_id,
                ROOT_PARENT_ID,
                name,
                text.as_bytes(),
                BackendSource::Local,
                &self.actor,
            )
            .await
            .unwrap()
    }

    pub fn status(&self, file_id: i64) -> FileStatus {
        self.db.get_file_record(file_id).unwrap().unwrap().status
    }

    pub fn record(&self, file_id: i64) -> FileRecord {
        self.db.get_file_record(file_id).unwrap().unwrap()
    }

    /// Poll the indexing status endpoint's projection until the file reaches `status`
    pub async fn wait_for_status(&self, file_id: i64, status: FileStatus) -> IndexingStatus {
        let poll = async {
            loop {
                let current = self
                    .orchestrator
                    .get_indexing_status(&[file_id], &self.actor)
                    .unwrap()
                    .pop()
                    .unwrap();
                if current.status == status {
                    return current;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), poll)
            .await
            .unwrap_or_else(|_| panic!("file {} never reached {}", file_id, status.as_str()))
    }
}

/// Newline-separated paragraphs long enough to produce several chunks
pub fn sample_text() -> String {
    [
        "Installing the agent requires a supported operating system and network access to the control plane.",
        "Configuration lives in a single TOML file; every key has a documented default value.",
        "Upgrades are rolling: each node drains its workload before the new binary is started.",
        "Backups are written nightly and retained for thirty days unless the retention policy says otherwise.",
        "Troubleshooting starts with the health endpoint, which reports the status of every dependency.",
    ]
    .join("\n")
}

pub fn custom_slice(min: usize, max: usize) -> SliceConfig {
    SliceConfig::custom(vec!["\n".to_string()], min, max)
}
