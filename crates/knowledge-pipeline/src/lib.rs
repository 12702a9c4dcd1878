//! knowledge-pipeline: document ingestion with a resumable slice/embed state machine
//!
//! Files uploaded into a repository are sliced into chunks and embedded by a pluggable
//! extraction backend (the local SQLite store or a managed HTTP service). Every stage
//! transition goes through a compare-and-set on the file's status and is recorded in a
//! task ledger, so interrupted work can be found and re-driven after a crash. Embedded
//! files can then be hit-tested with similarity queries.

pub mod catalog;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod retrieval;
pub mod server;
pub mod storage;
pub mod types;

pub use catalog::Catalog;
pub use config::PipelineConfig;
pub use error::{Error, ErrorKind, Result};
pub use processing::{PipelineOrchestrator, RecoverySweeper};
pub use retrieval::RetrievalEngine;
pub use storage::KnowledgeDb;
pub use types::{
    Actor, BackendSource, FileRecord, FileStatus, SliceConfig, SliceType, TaskStage, TaskStatus,
};
