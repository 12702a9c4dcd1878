//! SQLite database for pipeline state
//!
//! Holds repositories, file records, the task ledger, the directory tree, chunks with their
//! vectors, and hit-test history. Every status change on a file record goes through a
//! compare-and-set `UPDATE ... WHERE status IN (...)` so two workers can never own the
//! same file for the same stage.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{
    BackendSource, FileRecord, FileStatus, Repository, SliceConfig, TaskStage,
};

/// SQLite-backed pipeline store
#[derive(Clone)]
pub struct KnowledgeDb {
    conn: Arc<Mutex<Connection>>,
}

impl KnowledgeDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::database("Failed to open database", e))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::database("Failed to open in-memory database", e))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#,
        )
        .map_err(|e| Error::database("Failed to set pragmas", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                owner_uid TEXT NOT NULL,
                space_id INTEGER,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_repositories_owner ON repositories(owner_uid, space_id, deleted);

            CREATE TABLE IF NOT EXISTS file_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                repo_id INTEGER NOT NULL,
                owner_uid TEXT NOT NULL,
                space_id INTEGER,
                name TEXT NOT NULL,
                file_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                char_count INTEGER NOT NULL DEFAULT 0,
                content_hash TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                status TEXT NOT NULL,
                slice_config TEXT,
                current_slice_config TEXT,
                enabled INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL,
                reason TEXT,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                failed_chunk_count INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_file_records_repo ON file_records(repo_id, deleted);
            CREATE INDEX IF NOT EXISTS idx_file_records_status ON file_records(status);

            CREATE TABLE IF NOT EXISTS processing_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL,
                repo_id INTEGER NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                owner_uid TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_processing_tasks_file_stage
                ON processing_tasks(file_id, stage, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_processing_tasks_one_pending
                ON processing_tasks(file_id, stage) WHERE status = 'pending';

            CREATE TABLE IF NOT EXISTS directory_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_id INTEGER NOT NULL,
                parent_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                is_file INTEGER NOT NULL,
                file_id INTEGER,
                visible INTEGER NOT NULL DEFAULT 1,
                hit_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_directory_nodes_parent ON directory_nodes(repo_id, parent_id);
            CREATE INDEX IF NOT EXISTS idx_directory_nodes_file ON directory_nodes(file_id);

            CREATE TABLE IF NOT EXISTS knowledge_chunks (
                id TEXT PRIMARY KEY,
                file_id INTEGER NOT NULL,
                doc_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                char_count INTEGER NOT NULL,
                references_json TEXT,
                audit_flagged INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                embedding BLOB,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_knowledge_chunks_doc ON knowledge_chunks(doc_id, chunk_index);

            CREATE TABLE IF NOT EXISTS hit_test_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                query TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_hit_test_history_repo ON hit_test_history(repo_id, user_id);
        "#,
        )
        .map_err(|e| Error::database("Failed to run migrations", e))?;

        tracing::debug!("Database migrations complete");
        Ok(())
    }

    // ==================== Repositories ====================

    pub fn insert_repository(
        &self,
        name: &str,
        owner_uid: &str,
        space_id: Option<i64>,
    ) -> Result<Repository> {
        let conn = self.conn.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO repositories (name, owner_uid, space_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, owner_uid, space_id, now.to_rfc3339()],
        )
        .map_err(|e| Error::database("Failed to insert repository", e))?;

        Ok(Repository {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            owner_uid: owner_uid.to_string(),
            space_id,
            created_at: now,
        })
    }

    /// A live repository; deleted ones read as absent
    pub fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, owner_uid, space_id, created_at FROM repositories WHERE id = ?1 AND deleted = 0",
            params![id],
            row_to_repository,
        )
        .optional()
        .map_err(|e| Error::database("Failed to get repository", e))
    }

    /// Live repositories of a space, or a user's personal ones when `space_id` is `None`
    pub fn list_repositories(&self, owner_uid: &str, space_id: Option<i64>) -> Result<Vec<Repository>> {
        let conn = self.conn.lock();
        let (sql, key): (&str, rusqlite::types::Value) = match space_id {
            Some(space) => (
                "SELECT id, name, owner_uid, space_id, created_at FROM repositories
                 WHERE space_id = ?1 AND deleted = 0 ORDER BY id DESC",
                space.into(),
            ),
            None => (
                "SELECT id, name, owner_uid, space_id, created_at FROM repositories
                 WHERE owner_uid = ?1 AND space_id IS NULL AND deleted = 0 ORDER BY id DESC",
                owner_uid.to_string().into(),
            ),
        };
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::database("Failed to prepare query", e))?;

        let repos = stmt
            .query_map(params![key], row_to_repository)
            .map_err(|e| Error::database("Failed to list repositories", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(repos)
    }

    /// Id of a live repository with this name in the same scope as `list_repositories`
    pub fn find_repository_by_name(
        &self,
        name: &str,
        owner_uid: &str,
        space_id: Option<i64>,
    ) -> Result<Option<i64>> {
        Ok(self
            .list_repositories(owner_uid, space_id)?
            .into_iter()
            .find(|r| r.name == name)
            .map(|r| r.id))
    }

    pub fn rename_repository(&self, id: i64, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE repositories SET name = ?1 WHERE id = ?2 AND deleted = 0",
                params![name, id],
            )
            .map_err(|e| Error::database("Failed to rename repository", e))?;
        Ok(changed == 1)
    }

    pub fn mark_repository_deleted(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE repositories SET deleted = 1 WHERE id = ?1 AND deleted = 0",
                params![id],
            )
            .map_err(|e| Error::database("Failed to delete repository", e))?;
        Ok(changed == 1)
    }

    // ==================== File Records ====================

    /// Insert a new record, returning its id
    pub fn insert_file_record(&self, record: &FileRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO file_records (
                uuid, repo_id, owner_uid, space_id, name, file_type, size, char_count,
                content_hash, storage_key, status, slice_config, current_slice_config,
                enabled, source, reason, chunk_count, failed_chunk_count, deleted,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            "#,
            params![
                record.uuid,
                record.repo_id,
                record.owner_uid,
                record.space_id,
                record.name,
                record.file_type,
                record.size as i64,
                record.char_count as i64,
                record.content_hash,
                record.storage_key,
                record.status.as_str(),
                slice_config_json(record.slice_config.as_ref())?,
                slice_config_json(record.current_slice_config.as_ref())?,
                record.enabled,
                record.source.as_str(),
                record.reason,
                record.chunk_count as i64,
                record.failed_chunk_count as i64,
                record.deleted,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::database("Failed to insert file record", e))?;

        Ok(conn.last_insert_rowid())
    }

    /// Get a record by id, including soft-deleted ones
    pub fn get_file_record(&self, id: i64) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM file_records WHERE id = ?1", FILE_COLUMNS),
            params![id],
            row_to_file_record,
        )
        .optional()
        .map_err(|e| Error::database("Failed to get file record", e))
    }

    /// Get several live records, in the order requested; unknown ids are skipped
    pub fn get_file_records(&self, ids: &[i64]) -> Result<Vec<FileRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_file_record(*id)? {
                if !record.deleted {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// All live records of a repository
    pub fn list_repo_files(&self, repo_id: i64) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM file_records WHERE repo_id = ?1 AND deleted = 0 ORDER BY id",
                FILE_COLUMNS
            ))
            .map_err(|e| Error::database("Failed to prepare query", e))?;

        let records = stmt
            .query_map(params![repo_id], row_to_file_record)
            .map_err(|e| Error::database("Failed to list files", e))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }

    /// Compare-and-set the status. Returns false when the file was not in one of `expected`.
    ///
    /// Leaving `EmbeddingSucceeded` always clears `enabled`.
    pub fn transition_status(
        &self,
        file_id: i64,
        expected: &[FileStatus],
        next: FileStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                &format!(
                    r#"
                    UPDATE file_records
                    SET status = ?1,
                        reason = ?2,
                        enabled = CASE WHEN ?1 = 'embedding_succeeded' THEN enabled ELSE 0 END,
                        updated_at = ?3
                    WHERE id = ?4 AND deleted = 0 AND status IN ({})
                    "#,
                    status_list(expected)
                ),
                params![next.as_str(), reason, Utc::now().to_rfc3339(), file_id],
            )
            .map_err(|e| Error::database("Failed to update file status", e))?;
        Ok(changed == 1)
    }

    /// Atomically move a file into a working status and open a pending ledger entry.
    ///
    /// Returns the ledger id, or `None` if the status gate rejected the move. When
    /// `slice_config` is given it is recorded as the requested config.
    pub fn begin_stage(
        &self,
        file_id: i64,
        expected: &[FileStatus],
        next: FileStatus,
        stage: TaskStage,
        owner_uid: &str,
        slice_config: Option<&SliceConfig>,
    ) -> Result<Option<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;
        let now = Utc::now().to_rfc3339();

        let changed = tx
            .execute(
                &format!(
                    r#"
                    UPDATE file_records
                    SET status = ?1,
                        reason = NULL,
                        slice_config = COALESCE(?2, slice_config),
                        enabled = 0,
                        updated_at = ?3
                    WHERE id = ?4 AND deleted = 0 AND status IN ({})
                    "#,
                    status_list(expected)
                ),
                params![next.as_str(), slice_config_json(slice_config)?, now, file_id],
            )
            .map_err(|e| Error::database("Failed to update file status", e))?;

        if changed != 1 {
            return Ok(None);
        }

        let repo_id: i64 = tx
            .query_row(
                "SELECT repo_id FROM file_records WHERE id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::database("Failed to read file repository", e))?;

        let task_id = super::ledger::upsert_pending(&tx, file_id, repo_id, stage, owner_uid, &now)?;

        tx.commit()
            .map_err(|e| Error::database("Failed to commit stage start", e))?;
        Ok(Some(task_id))
    }

    /// `Parsing -> ParseSucceeded`, recording counts
    pub fn complete_parse(&self, file_id: i64, chunk_count: u32, char_count: u64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                r#"
                UPDATE file_records
                SET status = 'parse_succeeded', reason = NULL, chunk_count = ?1,
                    char_count = ?2, failed_chunk_count = 0, enabled = 0, updated_at = ?3
                WHERE id = ?4 AND deleted = 0 AND status = 'parsing'
                "#,
                params![chunk_count as i64, char_count as i64, Utc::now().to_rfc3339(), file_id],
            )
            .map_err(|e| Error::database("Failed to record parse result", e))?;
        Ok(changed == 1)
    }

    /// `Embedding -> EmbeddingSucceeded`, enabling the file and promoting its slice config
    pub fn complete_embed(&self, file_id: i64, failed_chunk_count: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                r#"
                UPDATE file_records
                SET status = 'embedding_succeeded', reason = NULL, enabled = 1,
                    current_slice_config = slice_config, failed_chunk_count = ?1, updated_at = ?2
                WHERE id = ?3 AND deleted = 0 AND status = 'embedding'
                "#,
                params![failed_chunk_count as i64, Utc::now().to_rfc3339(), file_id],
            )
            .map_err(|e| Error::database("Failed to record embed result", e))?;
        Ok(changed == 1)
    }

    /// Toggle retrieval participation. Enabling only succeeds on embedded files.
    pub fn set_file_enabled(&self, file_id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let sql = if enabled {
            "UPDATE file_records SET enabled = 1, updated_at = ?1
             WHERE id = ?2 AND deleted = 0 AND status = 'embedding_succeeded'"
        } else {
            "UPDATE file_records SET enabled = 0, updated_at = ?1 WHERE id = ?2 AND deleted = 0"
        };
        let changed = conn
            .execute(sql, params![Utc::now().to_rfc3339(), file_id])
            .map_err(|e| Error::database("Failed to toggle file", e))?;
        Ok(changed == 1)
    }

    pub fn rename_file(&self, file_id: i64, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE file_records SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, Utc::now().to_rfc3339(), file_id],
        )
        .map_err(|e| Error::database("Failed to rename file", e))?;
        Ok(())
    }

    /// Soft-delete records; they drop out of listings and retrieval.
    ///
    /// All-or-nothing: if any live record is being parsed or embedded the whole batch is
    /// left untouched and a conflict is returned. Already-deleted ids are skipped.
    pub fn soft_delete_files(&self, file_ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE file_records SET deleted = 1, enabled = 0, updated_at = ?1 \
             WHERE id = ?2 AND deleted = 0 AND status NOT IN ({})",
            status_list(&[FileStatus::Parsing, FileStatus::Embedding])
        );

        let mut deleted = 0;
        for id in file_ids {
            let changed = tx
                .execute(&sql, params![now, id])
                .map_err(|e| Error::database("Failed to delete file record", e))?;
            if changed == 0 {
                let busy: Option<String> = tx
                    .query_row(
                        "SELECT name FROM file_records WHERE id = ?1 AND deleted = 0",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| Error::database("Failed to read file record", e))?;
                if let Some(name) = busy {
                    return Err(Error::conflict(format!(
                        "File '{}' is being processed and cannot be deleted",
                        name
                    )));
                }
            }
            deleted += changed;
        }

        tx.commit()
            .map_err(|e| Error::database("Failed to commit transaction", e))?;
        Ok(deleted)
    }
}

// ==================== Helper Functions ====================

const FILE_COLUMNS: &str = "id, uuid, repo_id, owner_uid, space_id, name, file_type, size, char_count, \
    content_hash, storage_key, status, slice_config, current_slice_config, enabled, source, reason, \
    chunk_count, failed_chunk_count, deleted, created_at, updated_at";

fn row_to_repository(row: &rusqlite::Row) -> rusqlite::Result<Repository> {
    let created_at: String = row.get(4)?;
    Ok(Repository {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_uid: row.get(2)?,
        space_id: row.get(3)?,
        created_at: parse_time(&created_at),
    })
}

/// Inline SQL list of status literals; values come from the enum, never from input
fn status_list(statuses: &[FileStatus]) -> String {
    if statuses.is_empty() {
        return "NULL".to_string();
    }
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn slice_config_json(config: Option<&SliceConfig>) -> Result<Option<String>> {
    config.map(serde_json::to_string).transpose().map_err(Error::from)
}

pub(crate) fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_file_record(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    let status: String = row.get(11)?;
    let slice_config: Option<String> = row.get(12)?;
    let current_slice_config: Option<String> = row.get(13)?;
    let source: String = row.get(15)?;
    let size: i64 = row.get(7)?;
    let char_count: i64 = row.get(8)?;
    let chunk_count: i64 = row.get(17)?;
    let failed_chunk_count: i64 = row.get(18)?;
    let created_at: String = row.get(20)?;
    let updated_at: String = row.get(21)?;

    Ok(FileRecord {
        id: row.get(0)?,
        uuid: row.get(1)?,
        repo_id: row.get(2)?,
        owner_uid: row.get(3)?,
        space_id: row.get(4)?,
        name: row.get(5)?,
        file_type: row.get(6)?,
        size: size as u64,
        char_count: char_count as u64,
        content_hash: row.get(9)?,
        storage_key: row.get(10)?,
        status: FileStatus::parse(&status).unwrap_or(FileStatus::Uploaded),
        slice_config: slice_config.and_then(|j| serde_json::from_str(&j).ok()),
        current_slice_config: current_slice_config.and_then(|j| serde_json::from_str(&j).ok()),
        enabled: row.get(14)?,
        source: BackendSource::parse(&source).unwrap_or_default(),
        reason: row.get(16)?,
        chunk_count: chunk_count as u32,
        failed_chunk_count: failed_chunk_count as u32,
        deleted: row.get(19)?,
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    })
}
