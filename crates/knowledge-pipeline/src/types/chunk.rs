//! Extracted knowledge chunks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reference pulled out of chunk text, e.g. an image link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkReference {
    pub label: String,
    pub link: String,
}

/// One unit of extracted content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub file_id: i64,
    /// External uuid of the owning file
    pub doc_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub char_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ChunkReference>,
    pub audit_flagged: bool,
    /// Disabled chunks stay stored but are never searched
    pub enabled: bool,
    /// A vector is stored for this chunk
    #[serde(default)]
    pub embedded: bool,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeChunk {
    pub fn new(file_id: i64, doc_id: &str, chunk_index: u32, content: String) -> Self {
        let char_count = content.chars().count() as u32;
        Self {
            id: Uuid::new_v4().to_string(),
            file_id,
            doc_id: doc_id.to_string(),
            chunk_index,
            content,
            char_count,
            references: Vec::new(),
            audit_flagged: false,
            enabled: true,
            embedded: false,
            created_at: Utc::now(),
        }
    }

    /// Flagged chunks are kept for review but must not be served
    pub fn flag_for_audit(&mut self) {
        self.audit_flagged = true;
        self.enabled = false;
    }
}

/// One page of a file's chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPage {
    pub total: u32,
    pub page: u32,
    pub page_size: u32,
    pub chunks: Vec<KnowledgeChunk>,
}

/// A chunk returned by a similarity search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub doc_id: String,
    pub content: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ChunkReference>,
}
