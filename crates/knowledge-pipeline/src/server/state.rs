//! Application state for the pipeline server

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::config::{EmbeddingProviderKind, PipelineConfig};
use crate::error::Result;
use crate::processing::{PipelineOrchestrator, RecoverySweeper, RetryPolicy};
use crate::providers::{
    AccessPolicy, BackendRegistry, DocumentStoreProvider, EmbeddingProvider, HashEmbedder,
    LocalBackend, LocalDocumentStore, LocalVectorStore, ManagedBackend, OllamaEmbedder,
    OwnerAccessPolicy,
};
use crate::retrieval::RetrievalEngine;
use crate::storage::KnowledgeDb;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: PipelineConfig,
    db: KnowledgeDb,
    orchestrator: PipelineOrchestrator,
    catalog: Catalog,
    retrieval: RetrievalEngine,
    /// Set once startup recovery has run
    ready: RwLock<bool>,
}

impl AppState {
    /// Open storage and wire every component from configuration
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        tracing::info!(
            "Initializing pipeline state (database: {})",
            config.storage.database_path.display()
        );

        let db = KnowledgeDb::new(&config.storage.database_path)?;
        let documents: Arc<dyn DocumentStoreProvider> =
            Arc::new(LocalDocumentStore::new(config.storage.documents_dir.clone())?);
        let retry_base = Duration::from_millis(config.processing.retry_base_delay_ms);

        let embedder: Arc<dyn EmbeddingProvider> = match config.embeddings.provider {
            EmbeddingProviderKind::Hash => {
                tracing::info!("Using hashing embedder ({} dims)", config.embeddings.dimensions);
                Arc::new(HashEmbedder::new(config.embeddings.dimensions))
            }
            EmbeddingProviderKind::Ollama => {
                tracing::info!(
                    "Using Ollama embeddings ({} at {})",
                    config.embeddings.model,
                    config.embeddings.ollama_url
                );
                Arc::new(OllamaEmbedder::new(&config.embeddings, retry_base)?)
            }
        };

        let local = LocalBackend::new(
            db.clone(),
            documents.clone(),
            embedder,
            Arc::new(LocalVectorStore::new(db.clone())),
            config.local.clone(),
        )
        .with_parallelism(config.embeddings.parallelism())
        .with_retry(RetryPolicy::new(config.embeddings.max_retries, retry_base));

        let mut backends = BackendRegistry::new().with(Arc::new(local));
        if let Some(managed) = &config.managed {
            tracing::info!("Managed extraction service at {}", managed.base_url);
            backends.register(Arc::new(ManagedBackend::new(managed.clone(), retry_base)?));
        }

        let access: Arc<dyn AccessPolicy> = Arc::new(OwnerAccessPolicy);
        Ok(Self::from_parts(config, db, backends, documents, access))
    }

    /// Assemble state from already-built collaborators
    pub fn from_parts(
        config: PipelineConfig,
        db: KnowledgeDb,
        backends: BackendRegistry,
        documents: Arc<dyn DocumentStoreProvider>,
        access: Arc<dyn AccessPolicy>,
    ) -> Self {
        let orchestrator = PipelineOrchestrator::new(
            db.clone(),
            backends.clone(),
            access.clone(),
            config.slicing.clone(),
            config.processing.clone(),
        );
        let catalog = Catalog::new(db.clone(), backends.clone(), documents, access.clone());
        let retrieval = RetrievalEngine::new(db.clone(), backends, access, config.retrieval.clone());

        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                orchestrator,
                catalog,
                retrieval,
                ready: RwLock::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &KnowledgeDb {
        &self.inner.db
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.inner.orchestrator
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.inner.retrieval
    }

    /// Recovery sweeper over this state's orchestrator
    pub fn sweeper(&self) -> RecoverySweeper {
        RecoverySweeper::new(
            self.inner.orchestrator.clone(),
            self.inner.config.recovery.liveness_secs,
        )
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    pub fn set_ready(&self, ready: bool) {
        *self.inner.ready.write() = ready;
    }
}
