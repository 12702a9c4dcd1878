//! Directory nodes and hit-test history

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::database::{parse_time, KnowledgeDb};
use crate::error::{Error, Result};
use crate::types::{DirectoryNode, HitTestHistory};

const NODE_COLUMNS: &str =
    "id, repo_id, parent_id, name, is_file, file_id, visible, hit_count, created_at";

impl KnowledgeDb {
    pub fn insert_node(
        &self,
        repo_id: i64,
        parent_id: i64,
        name: &str,
        file_id: Option<i64>,
        visible: bool,
    ) -> Result<DirectoryNode> {
        let conn = self.lock();
        let now = Utc::now();
        conn.execute(
            r#"
            INSERT INTO directory_nodes (repo_id, parent_id, name, is_file, file_id, visible, hit_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
            "#,
            params![repo_id, parent_id, name, file_id.is_some(), file_id, visible, now.to_rfc3339()],
        )
        .map_err(|e| Error::database("Failed to insert directory node", e))?;

        Ok(DirectoryNode {
            id: conn.last_insert_rowid(),
            repo_id,
            parent_id,
            name: name.to_string(),
            is_file: file_id.is_some(),
            file_id,
            visible,
            hit_count: 0,
            created_at: now,
        })
    }

    pub fn get_node(&self, id: i64) -> Result<Option<DirectoryNode>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM directory_nodes WHERE id = ?1", NODE_COLUMNS),
            params![id],
            row_to_node,
        )
        .optional()
        .map_err(|e| Error::database("Failed to get directory node", e))
    }

    /// Leaf node of a file
    pub fn node_for_file(&self, file_id: i64) -> Result<Option<DirectoryNode>> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM directory_nodes WHERE file_id = ?1 AND is_file = 1 ORDER BY id LIMIT 1",
                NODE_COLUMNS
            ),
            params![file_id],
            row_to_node,
        )
        .optional()
        .map_err(|e| Error::database("Failed to get file node", e))
    }

    /// Visible children, folders first
    pub fn list_children(&self, repo_id: i64, parent_id: i64) -> Result<Vec<DirectoryNode>> {
        self.query_nodes(
            &format!(
                "SELECT {} FROM directory_nodes WHERE repo_id = ?1 AND parent_id = ?2 AND visible = 1
                 ORDER BY is_file, name",
                NODE_COLUMNS
            ),
            params![repo_id, parent_id],
        )
    }

    /// Every node of a repository, visible or not
    pub fn list_repo_nodes(&self, repo_id: i64) -> Result<Vec<DirectoryNode>> {
        self.query_nodes(
            &format!("SELECT {} FROM directory_nodes WHERE repo_id = ?1 ORDER BY id", NODE_COLUMNS),
            params![repo_id],
        )
    }

    fn query_nodes(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<DirectoryNode>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::database("Failed to prepare query", e))?;
        let nodes = stmt
            .query_map(args, row_to_node)
            .map_err(|e| Error::database("Failed to list directory nodes", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(nodes)
    }

    pub fn rename_node(&self, id: i64, name: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE directory_nodes SET name = ?1 WHERE id = ?2",
            params![name, id],
        )
        .map_err(|e| Error::database("Failed to rename directory node", e))?;
        Ok(())
    }

    pub fn set_file_node_visible(&self, file_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE directory_nodes SET visible = 1 WHERE file_id = ?1 AND is_file = 1",
            params![file_id],
        )
        .map_err(|e| Error::database("Failed to show file node", e))?;
        Ok(())
    }

    pub fn delete_nodes(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;
        let mut deleted = 0;
        for id in ids {
            deleted += tx
                .execute("DELETE FROM directory_nodes WHERE id = ?1", params![id])
                .map_err(|e| Error::database("Failed to delete directory node", e))?;
        }
        tx.commit()
            .map_err(|e| Error::database("Failed to commit node deletion", e))?;
        Ok(deleted)
    }

    /// Record one hit test: bump the hit counter of each listed file and append the
    /// query to the caller's history, in one transaction.
    pub fn record_hit_test(
        &self,
        repo_id: i64,
        user_id: &str,
        query: &str,
        file_ids: &[i64],
    ) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;
        for id in file_ids {
            tx.execute(
                "UPDATE directory_nodes SET hit_count = hit_count + 1 WHERE file_id = ?1 AND is_file = 1",
                params![id],
            )
            .map_err(|e| Error::database("Failed to update hit count", e))?;
        }
        tx.execute(
            "INSERT INTO hit_test_history (repo_id, user_id, query, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![repo_id, user_id, query, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::database("Failed to record hit test", e))?;
        let id = tx.last_insert_rowid();
        tx.commit()
            .map_err(|e| Error::database("Failed to commit transaction", e))?;
        Ok(id)
    }

    /// A user's recent queries against a repository, newest first
    pub fn list_hit_history(&self, repo_id: i64, user_id: &str, limit: usize) -> Result<Vec<HitTestHistory>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, repo_id, user_id, query, created_at FROM hit_test_history
                 WHERE repo_id = ?1 AND user_id = ?2 ORDER BY id DESC LIMIT ?3",
            )
            .map_err(|e| Error::database("Failed to prepare query", e))?;

        let history = stmt
            .query_map(params![repo_id, user_id, limit as i64], |row| {
                let created_at: String = row.get(4)?;
                Ok(HitTestHistory {
                    id: row.get(0)?,
                    repo_id: row.get(1)?,
                    user_id: row.get(2)?,
                    query: row.get(3)?,
                    created_at: parse_time(&created_at),
                })
            })
            .map_err(|e| Error::database("Failed to list hit history", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(history)
    }
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<DirectoryNode> {
    let hit_count: i64 = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(DirectoryNode {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        is_file: row.get(4)?,
        file_id: row.get(5)?,
        visible: row.get(6)?,
        hit_count: hit_count as u64,
        created_at: parse_time(&created_at),
    })
}
