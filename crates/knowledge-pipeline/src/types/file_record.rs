//! File record types and the per-file lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::slice::SliceConfig;

/// Lifecycle status of a file in the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Bytes stored, nothing processed yet
    Uploaded,
    /// Chunking in flight
    Parsing,
    /// Chunking failed
    ParseFailed,
    /// Chunks available, not yet embedded
    ParseSucceeded,
    /// Embedding in flight
    Embedding,
    /// Embedding failed
    EmbeddingFailed,
    /// Embedded and eligible for retrieval
    EmbeddingSucceeded,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploaded => "uploaded",
            FileStatus::Parsing => "parsing",
            FileStatus::ParseFailed => "parse_failed",
            FileStatus::ParseSucceeded => "parse_succeeded",
            FileStatus::Embedding => "embedding",
            FileStatus::EmbeddingFailed => "embedding_failed",
            FileStatus::EmbeddingSucceeded => "embedding_succeeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(FileStatus::Uploaded),
            "parsing" => Some(FileStatus::Parsing),
            "parse_failed" => Some(FileStatus::ParseFailed),
            "parse_succeeded" => Some(FileStatus::ParseSucceeded),
            "embedding" => Some(FileStatus::Embedding),
            "embedding_failed" => Some(FileStatus::EmbeddingFailed),
            "embedding_succeeded" => Some(FileStatus::EmbeddingSucceeded),
            _ => None,
        }
    }

    /// A worker currently owns the file
    pub fn is_in_flight(&self) -> bool {
        matches!(self, FileStatus::Parsing | FileStatus::Embedding)
    }

    /// Nothing will move this file without an explicit request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::ParseFailed | FileStatus::EmbeddingFailed | FileStatus::EmbeddingSucceeded
        )
    }

    /// Chunking has resolved, whichever way it went
    pub fn parse_resolved(&self) -> bool {
        !matches!(self, FileStatus::Uploaded | FileStatus::Parsing)
    }

    /// Statuses from which a new slice may start
    pub fn sliceable() -> &'static [FileStatus] {
        &[
            FileStatus::Uploaded,
            FileStatus::ParseFailed,
            FileStatus::ParseSucceeded,
            FileStatus::EmbeddingFailed,
            FileStatus::EmbeddingSucceeded,
        ]
    }

    /// Statuses from which embedding may start
    pub fn embeddable() -> &'static [FileStatus] {
        &[
            FileStatus::ParseSucceeded,
            FileStatus::EmbeddingFailed,
            FileStatus::EmbeddingSucceeded,
        ]
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which extraction backend owns a file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendSource {
    /// Slicing and embedding against the in-process knowledge store
    #[default]
    Local,
    /// Externally hosted document service
    Managed,
}

impl BackendSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendSource::Local => "local",
            BackendSource::Managed => "managed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(BackendSource::Local),
            "managed" => Some(BackendSource::Managed),
            _ => None,
        }
    }
}

/// Durable per-file metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    /// External id used by extraction backends and chunk rows
    pub uuid: String,
    pub repo_id: i64,
    pub owner_uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_id: Option<i64>,
    pub name: String,
    /// Lower-cased extension
    pub file_type: String,
    pub size: u64,
    pub char_count: u64,
    pub content_hash: String,
    /// Key returned by the upload collaborator
    pub storage_key: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice_config: Option<SliceConfig>,
    /// Config that produced the currently embedded chunks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_slice_config: Option<SliceConfig>,
    pub enabled: bool,
    pub source: BackendSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub chunk_count: u32,
    pub failed_chunk_count: u32,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to register a freshly uploaded file
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub repo_id: i64,
    pub owner_uid: String,
    pub space_id: Option<i64>,
    pub name: String,
    pub file_type: String,
    pub size: u64,
    pub char_count: u64,
    pub content_hash: String,
    pub storage_key: String,
    pub source: BackendSource,
}

impl FileRecord {
    /// Build an unsaved record in the `Uploaded` state
    pub fn uploaded(new: NewFileRecord) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uuid: Uuid::new_v4().simple().to_string(),
            repo_id: new.repo_id,
            owner_uid: new.owner_uid,
            space_id: new.space_id,
            name: new.name,
            file_type: new.file_type,
            size: new.size,
            char_count: new.char_count,
            content_hash: new.content_hash,
            storage_key: new.storage_key,
            status: FileStatus::Uploaded,
            slice_config: None,
            current_slice_config: None,
            enabled: false,
            source: new.source,
            reason: None,
            chunk_count: 0,
            failed_chunk_count: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this file counts as an image for size limits and chunking messages
    pub fn is_image(&self) -> bool {
        is_image_type(&self.file_type)
    }
}

/// Image extensions accepted by the managed service
pub fn is_image_type(file_type: &str) -> bool {
    matches!(file_type, "jpg" | "jpeg" | "png" | "bmp")
}
