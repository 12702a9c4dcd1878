//! Task ledger: durable record of slice/embed attempts
//!
//! A worker's row is opened (or superseded in place) before any backend call and closed
//! only after the file record has been updated, so a crash in between always leaves a
//! `pending` row for the recovery sweeper.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::database::{parse_time, KnowledgeDb};
use crate::error::{Error, Result};
use crate::types::{ProcessingTask, TaskStage, TaskStatus};

/// Open a pending row for (file, stage), reusing an existing pending row if there is one
pub(crate) fn upsert_pending(
    conn: &Connection,
    file_id: i64,
    repo_id: i64,
    stage: TaskStage,
    owner_uid: &str,
    now: &str,
) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM processing_tasks WHERE file_id = ?1 AND stage = ?2 AND status = 'pending'",
            params![file_id, stage.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::database("Failed to look up pending task", e))?;

    match existing {
        Some(id) => {
            conn.execute(
                r#"
                UPDATE processing_tasks
                SET owner_uid = ?1, attempts = attempts + 1, message = NULL,
                    created_at = ?2, updated_at = ?2
                WHERE id = ?3
                "#,
                params![owner_uid, now, id],
            )
            .map_err(|e| Error::database("Failed to supersede pending task", e))?;
            Ok(id)
        }
        None => {
            conn.execute(
                r#"
                INSERT INTO processing_tasks
                    (file_id, repo_id, stage, status, owner_uid, attempts, created_at, updated_at)
                VALUES (?1, ?2, ?3, 'pending', ?4, 1, ?5, ?5)
                "#,
                params![file_id, repo_id, stage.as_str(), owner_uid, now],
            )
            .map_err(|e| Error::database("Failed to insert task", e))?;
            Ok(conn.last_insert_rowid())
        }
    }
}

impl KnowledgeDb {
    /// Open a pending ledger row without touching the file record
    pub fn begin_task(
        &self,
        file_id: i64,
        repo_id: i64,
        stage: TaskStage,
        owner_uid: &str,
    ) -> Result<i64> {
        let conn = self.lock();
        upsert_pending(&conn, file_id, repo_id, stage, owner_uid, &Utc::now().to_rfc3339())
    }

    /// Close a pending row. Rows that are already closed are left as they are.
    pub fn complete_task(&self, task_id: i64, status: TaskStatus, message: Option<&str>) -> Result<bool> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE processing_tasks SET status = ?1, message = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![status.as_str(), message, Utc::now().to_rfc3339(), task_id],
            )
            .map_err(|e| Error::database("Failed to complete task", e))?;
        Ok(changed == 1)
    }

    pub fn get_task(&self, task_id: i64) -> Result<Option<ProcessingTask>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM processing_tasks WHERE id = ?1", TASK_COLUMNS),
            params![task_id],
            row_to_task,
        )
        .optional()
        .map_err(|e| Error::database("Failed to get task", e))
    }

    /// Every pending row, oldest first
    pub fn pending_tasks(&self) -> Result<Vec<ProcessingTask>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM processing_tasks WHERE status = 'pending' ORDER BY id",
                TASK_COLUMNS
            ))
            .map_err(|e| Error::database("Failed to prepare query", e))?;

        let tasks = stmt
            .query_map([], row_to_task)
            .map_err(|e| Error::database("Failed to list pending tasks", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    /// Ledger history of one file, oldest first
    pub fn tasks_for_file(&self, file_id: i64) -> Result<Vec<ProcessingTask>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM processing_tasks WHERE file_id = ?1 ORDER BY id",
                TASK_COLUMNS
            ))
            .map_err(|e| Error::database("Failed to prepare query", e))?;

        let tasks = stmt
            .query_map(params![file_id], row_to_task)
            .map_err(|e| Error::database("Failed to list file tasks", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }
}

const TASK_COLUMNS: &str =
    "id, file_id, repo_id, stage, status, owner_uid, attempts, message, created_at, updated_at";

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<ProcessingTask> {
    let stage: String = row.get(3)?;
    let status: String = row.get(4)?;
    let attempts: i64 = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(ProcessingTask {
        id: row.get(0)?,
        file_id: row.get(1)?,
        repo_id: row.get(2)?,
        stage: TaskStage::parse(&stage).unwrap_or(TaskStage::Parse),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        owner_uid: row.get(5)?,
        attempts: attempts as u32,
        message: row.get(7)?,
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_attempt_supersedes_pending() {
        let db = KnowledgeDb::in_memory().unwrap();

        let first = db.begin_task(7, 1, TaskStage::Parse, "u1").unwrap();
        let second = db.begin_task(7, 1, TaskStage::Parse, "u2").unwrap();
        assert_eq!(first, second);

        let task = db.get_task(first).unwrap().unwrap();
        assert_eq!(task.attempts, 2);
        assert_eq!(task.owner_uid, "u2");
        assert_eq!(db.pending_tasks().unwrap().len(), 1);
    }

    #[test]
    fn test_stages_are_independent() {
        let db = KnowledgeDb::in_memory().unwrap();
        db.begin_task(7, 1, TaskStage::Parse, "u1").unwrap();
        db.begin_task(7, 1, TaskStage::Embed, "u1").unwrap();
        assert_eq!(db.pending_tasks().unwrap().len(), 2);
    }

    #[test]
    fn test_closed_task_not_reopened() {
        let db = KnowledgeDb::in_memory().unwrap();
        let id = db.begin_task(7, 1, TaskStage::Embed, "u1").unwrap();

        assert!(db.complete_task(id, TaskStatus::Failed, Some("timeout")).unwrap());
        assert!(!db.complete_task(id, TaskStatus::Done, None).unwrap());

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.message.as_deref(), Some("timeout"));

        let next = db.begin_task(7, 1, TaskStage::Embed, "u1").unwrap();
        assert_ne!(next, id);
        assert_eq!(db.tasks_for_file(7).unwrap().len(), 2);
    }
}
