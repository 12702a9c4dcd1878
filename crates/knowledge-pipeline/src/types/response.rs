//! Result payloads returned by pipeline and retrieval operations

use serde::{Deserialize, Serialize};

use super::chunk::ChunkReference;
use super::file_record::FileStatus;

/// Per-file result of a batch slice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub file_id: i64,
    /// A worker was started for this file
    pub dispatched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn rejected(file_id: i64, error: impl Into<String>) -> Self {
        Self {
            file_id,
            dispatched: false,
            status: None,
            chunk_count: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of `slice_files`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub files: Vec<FileOutcome>,
}

impl SliceOutcome {
    pub fn from_files(files: Vec<FileOutcome>) -> Self {
        let succeeded = files
            .iter()
            .filter(|f| f.dispatched && f.error.is_none())
            .count();
        Self {
            succeeded,
            failed: files.len() - succeeded,
            files,
        }
    }

    pub fn get(&self, file_id: i64) -> Option<&FileOutcome> {
        self.files.iter().find(|f| f.file_id == file_id)
    }
}

/// Outcome of `embed_files`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedDispatch {
    pub accepted: Vec<i64>,
    /// Files left alone because a worker already owns them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<FileOutcome>,
    /// Final per-file state, filled when the call waited for its workers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileOutcome>,
}

/// Outcome of `retry`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryOutcome {
    /// Re-entered slicing
    pub reparsed: Vec<i64>,
    /// Re-entered embedding
    pub reembedded: Vec<i64>,
    /// Not in a failed state; left untouched
    pub skipped: Vec<i64>,
}

/// Read-only status projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub file_id: i64,
    pub status: FileStatus,
    pub chunk_count: u32,
    pub failed_chunk_count: u32,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A chunk returned by a hit test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitChunk {
    pub file_id: i64,
    pub file_name: String,
    pub doc_id: String,
    pub content: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ChunkReference>,
}
