//! Core types for the ingestion pipeline

pub mod chunk;
pub mod directory;
pub mod file_record;
pub mod response;
pub mod slice;
pub mod task;

pub use chunk::{ChunkPage, ChunkReference, KnowledgeChunk, ScoredChunk};
pub use directory::{Actor, DirectoryNode, HitTestHistory, Repository, ROOT_PARENT_ID};
pub use file_record::{is_image_type, BackendSource, FileRecord, FileStatus, NewFileRecord};
pub use response::{
    EmbedDispatch, FileOutcome, HitChunk, IndexingStatus, RetryOutcome, SliceOutcome,
};
pub use slice::{SliceConfig, SliceType, DEFAULT_SEPARATOR};
pub use task::{ProcessingTask, TaskStage, TaskStatus};
