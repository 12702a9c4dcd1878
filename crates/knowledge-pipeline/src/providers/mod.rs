//! Provider abstractions: extraction backends, embeddings, vector storage, document storage
//! and access policy
//!
//! Trait-based so the pipeline can drive either the local store or the managed service,
//! and so tests can swap in scripted collaborators.

pub mod access;
pub mod document_store;
pub mod embedding;
pub mod extraction;
pub mod hash_embedder;
pub mod local;
pub mod local_backend;
pub mod managed;
pub mod ollama;
pub mod vector_store;

pub use access::{AccessPolicy, AllowAllPolicy, OwnerAccessPolicy};
pub use document_store::{DocumentStoreProvider, StoredObject};
pub use embedding::EmbeddingProvider;
pub use extraction::{BackendRegistry, EmbedOutcome, ExtractOutcome, ExtractionBackend};
pub use hash_embedder::HashEmbedder;
pub use local::{LocalDocumentStore, LocalVectorStore};
pub use local_backend::LocalBackend;
pub use managed::ManagedBackend;
pub use ollama::OllamaEmbedder;
pub use vector_store::{VectorSearchResult, VectorStoreProvider};
