//! Repository tree nodes and the repository / caller identities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parent id of top-level nodes
pub const ROOT_PARENT_ID: i64 = -1;

/// A folder or a leaf pointing at one file record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub id: i64,
    pub repo_id: i64,
    pub parent_id: i64,
    pub name: String,
    pub is_file: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    /// Leaves stay hidden until their file is sent to embedding
    pub visible: bool,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A knowledge repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub owner_uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Identity of whoever issued a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub space_id: Option<i64>,
    /// Background work (recovery, chaining) skips permission checks
    pub system: bool,
}

impl Actor {
    pub fn user(user_id: impl Into<String>, space_id: Option<i64>) -> Self {
        Self {
            user_id: user_id.into(),
            space_id,
            system: false,
        }
    }

    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            space_id: None,
            system: true,
        }
    }
}

/// One recorded hit test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitTestHistory {
    pub id: i64,
    pub repo_id: i64,
    pub user_id: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
}
