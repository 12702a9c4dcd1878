//! Chunk rows and their embeddings

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use super::database::{parse_time, KnowledgeDb};
use crate::error::{Error, Result};
use crate::types::{FileStatus, KnowledgeChunk};

const CHUNK_COLUMNS: &str = "id, file_id, doc_id, chunk_index, content, char_count, references_json, \
    audit_flagged, created_at, enabled, embedding IS NOT NULL";

impl KnowledgeDb {
    /// Replace every chunk of a document. Old vectors go with the old rows.
    pub fn replace_chunks(&self, doc_id: &str, chunks: &[KnowledgeChunk]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;

        tx.execute("DELETE FROM knowledge_chunks WHERE doc_id = ?1", params![doc_id])
            .map_err(|e| Error::database("Failed to clear chunks", e))?;

        for chunk in chunks {
            insert_chunk(&tx, chunk, None)?;
        }

        tx.commit()
            .map_err(|e| Error::database("Failed to commit chunks", e))?;
        Ok(())
    }

    pub fn list_chunks(&self, doc_id: &str) -> Result<Vec<KnowledgeChunk>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM knowledge_chunks WHERE doc_id = ?1 ORDER BY chunk_index",
                CHUNK_COLUMNS
            ))
            .map_err(|e| Error::database("Failed to prepare query", e))?;

        let chunks = stmt
            .query_map(params![doc_id], row_to_chunk)
            .map_err(|e| Error::database("Failed to list chunks", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(chunks)
    }

    /// A window of a document's chunks in index order
    pub fn list_chunks_page(&self, doc_id: &str, offset: u32, limit: u32) -> Result<Vec<KnowledgeChunk>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM knowledge_chunks WHERE doc_id = ?1 ORDER BY chunk_index LIMIT ?2 OFFSET ?3",
                CHUNK_COLUMNS
            ))
            .map_err(|e| Error::database("Failed to prepare query", e))?;

        let chunks = stmt
            .query_map(params![doc_id, limit, offset], row_to_chunk)
            .map_err(|e| Error::database("Failed to list chunks", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(chunks)
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Result<Option<KnowledgeChunk>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM knowledge_chunks WHERE id = ?1", CHUNK_COLUMNS),
            params![chunk_id],
            row_to_chunk,
        )
        .optional()
        .map_err(|e| Error::database("Failed to get chunk", e))
    }

    pub fn count_chunks(&self, doc_id: &str) -> Result<u32> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM knowledge_chunks WHERE doc_id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::database("Failed to count chunks", e))?;
        Ok(count as u32)
    }

    /// Drop all vectors of a document, keeping the text
    pub fn clear_embeddings(&self, doc_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE knowledge_chunks SET embedding = NULL WHERE doc_id = ?1",
            params![doc_id],
        )
        .map_err(|e| Error::database("Failed to clear embeddings", e))?;
        Ok(())
    }

    pub fn store_embedding(&self, chunk_id: &str, embedding: &[f32]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE knowledge_chunks SET embedding = ?1 WHERE id = ?2",
            params![encode_vector(embedding), chunk_id],
        )
        .map_err(|e| Error::database("Failed to store embedding", e))?;
        Ok(())
    }

    /// Enabled chunks of the given documents that carry a vector
    pub fn embedded_chunks(&self, doc_ids: &[String]) -> Result<Vec<(KnowledgeChunk, Vec<f32>)>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {}, embedding FROM knowledge_chunks
                 WHERE doc_id = ?1 AND enabled = 1 AND embedding IS NOT NULL
                 ORDER BY chunk_index",
                CHUNK_COLUMNS
            ))
            .map_err(|e| Error::database("Failed to prepare query", e))?;

        let mut results = Vec::new();
        for doc_id in doc_ids {
            let rows = stmt
                .query_map(params![doc_id], |row| {
                    let chunk = row_to_chunk(row)?;
                    let blob: Vec<u8> = row.get(11)?;
                    Ok((chunk, decode_vector(&blob)))
                })
                .map_err(|e| Error::database("Failed to load embeddings", e))?;
            results.extend(rows.filter_map(|r| r.ok()));
        }
        Ok(results)
    }

    pub fn delete_chunks(&self, doc_id: &str) -> Result<usize> {
        let conn = self.lock();
        conn.execute("DELETE FROM knowledge_chunks WHERE doc_id = ?1", params![doc_id])
            .map_err(|e| Error::database("Failed to delete chunks", e))
    }

    // ==================== Manual chunk edits ====================
    //
    // Each edit re-checks, inside its transaction, that the owning file is still live and
    // embedded; `None`/`false` means the file changed state or the chunk is gone.

    /// Append a chunk after the document's last one
    pub fn append_chunk(
        &self,
        chunk: &KnowledgeChunk,
        embedding: Option<&[f32]>,
    ) -> Result<Option<KnowledgeChunk>> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;
        if !file_accepts_edits(&tx, chunk.file_id)? {
            return Ok(None);
        }

        let next_index: u32 = tx
            .query_row(
                "SELECT COALESCE(MAX(chunk_index) + 1, 0) FROM knowledge_chunks WHERE doc_id = ?1",
                params![chunk.doc_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::database("Failed to read chunk index", e))?;
        let stored = KnowledgeChunk {
            chunk_index: next_index,
            embedded: embedding.is_some(),
            ..chunk.clone()
        };
        insert_chunk(&tx, &stored, embedding)?;
        sync_chunk_count(&tx, chunk.file_id)?;

        tx.commit()
            .map_err(|e| Error::database("Failed to commit chunk", e))?;
        Ok(Some(stored))
    }

    /// Overwrite a chunk's text, flags and vector
    pub fn update_chunk(&self, chunk: &KnowledgeChunk, embedding: Option<&[f32]>) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;
        if !file_accepts_edits(&tx, chunk.file_id)? {
            return Ok(false);
        }

        let changed = tx
            .execute(
                r#"
                UPDATE knowledge_chunks
                SET content = ?1, char_count = ?2, references_json = ?3, audit_flagged = ?4,
                    enabled = ?5, embedding = ?6
                WHERE id = ?7 AND file_id = ?8
                "#,
                params![
                    chunk.content,
                    chunk.char_count,
                    references_json(chunk)?,
                    chunk.audit_flagged,
                    chunk.enabled,
                    embedding.map(encode_vector),
                    chunk.id,
                    chunk.file_id,
                ],
            )
            .map_err(|e| Error::database("Failed to update chunk", e))?;

        tx.commit()
            .map_err(|e| Error::database("Failed to commit chunk", e))?;
        Ok(changed == 1)
    }

    /// Toggle a chunk; a vector passed along replaces the stored one
    pub fn set_chunk_enabled(
        &self,
        chunk_id: &str,
        file_id: i64,
        enabled: bool,
        embedding: Option<&[f32]>,
    ) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;
        if !file_accepts_edits(&tx, file_id)? {
            return Ok(false);
        }

        let changed = tx
            .execute(
                "UPDATE knowledge_chunks SET enabled = ?1, embedding = COALESCE(?2, embedding)
                 WHERE id = ?3 AND file_id = ?4",
                params![enabled, embedding.map(encode_vector), chunk_id, file_id],
            )
            .map_err(|e| Error::database("Failed to toggle chunk", e))?;

        tx.commit()
            .map_err(|e| Error::database("Failed to commit chunk", e))?;
        Ok(changed == 1)
    }

    pub fn delete_chunk(&self, chunk_id: &str, file_id: i64) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("Failed to begin transaction", e))?;
        if !file_accepts_edits(&tx, file_id)? {
            return Ok(false);
        }

        let changed = tx
            .execute(
                "DELETE FROM knowledge_chunks WHERE id = ?1 AND file_id = ?2",
                params![chunk_id, file_id],
            )
            .map_err(|e| Error::database("Failed to delete chunk", e))?;
        sync_chunk_count(&tx, file_id)?;

        tx.commit()
            .map_err(|e| Error::database("Failed to commit chunk", e))?;
        Ok(changed == 1)
    }
}

fn insert_chunk(tx: &Transaction, chunk: &KnowledgeChunk, embedding: Option<&[f32]>) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO knowledge_chunks
            (id, file_id, doc_id, chunk_index, content, char_count, references_json, audit_flagged,
             enabled, embedding, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            chunk.id,
            chunk.file_id,
            chunk.doc_id,
            chunk.chunk_index,
            chunk.content,
            chunk.char_count,
            references_json(chunk)?,
            chunk.audit_flagged,
            chunk.enabled,
            embedding.map(encode_vector),
            chunk.created_at.to_rfc3339(),
        ],
    )
    .map_err(|e| Error::database("Failed to insert chunk", e))?;
    Ok(())
}

fn references_json(chunk: &KnowledgeChunk) -> Result<Option<String>> {
    if chunk.references.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&chunk.references)?))
}

fn file_accepts_edits(tx: &Transaction, file_id: i64) -> Result<bool> {
    let live: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM file_records WHERE id = ?1 AND deleted = 0 AND status = ?2",
            params![file_id, FileStatus::EmbeddingSucceeded.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| Error::database("Failed to read file status", e))?;
    Ok(live == 1)
}

fn sync_chunk_count(tx: &Transaction, file_id: i64) -> Result<()> {
    tx.execute(
        "UPDATE file_records
         SET chunk_count = (SELECT COUNT(*) FROM knowledge_chunks WHERE file_id = ?1), updated_at = ?2
         WHERE id = ?1",
        params![file_id, Utc::now().to_rfc3339()],
    )
    .map_err(|e| Error::database("Failed to update chunk count", e))?;
    Ok(())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<KnowledgeChunk> {
    let references: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    Ok(KnowledgeChunk {
        id: row.get(0)?,
        file_id: row.get(1)?,
        doc_id: row.get(2)?,
        chunk_index: row.get(3)?,
        content: row.get(4)?,
        char_count: row.get(5)?,
        references: references
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        audit_flagged: row.get(7)?,
        enabled: row.get(9)?,
        embedded: row.get(10)?,
        created_at: parse_time(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::tests::embedded_file;
    use crate::types::TaskStage;

    #[test]
    fn test_replace_drops_previous_chunks_and_vectors() {
        let db = KnowledgeDb::in_memory().unwrap();
        let first = vec![
            KnowledgeChunk::new(1, "doc", 0, "alpha".to_string()),
            KnowledgeChunk::new(1, "doc", 1, "beta".to_string()),
        ];
        db.replace_chunks("doc", &first).unwrap();
        db.store_embedding(&first[0].id, &[0.5, -1.25]).unwrap();

        let embedded = db.embedded_chunks(&["doc".to_string()]).unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].1, vec![0.5, -1.25]);

        db.replace_chunks("doc", &[KnowledgeChunk::new(1, "doc", 0, "gamma".to_string())])
            .unwrap();
        assert_eq!(db.count_chunks("doc").unwrap(), 1);
        assert!(db.embedded_chunks(&["doc".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn test_delete_chunks() {
        let db = KnowledgeDb::in_memory().unwrap();
        db.replace_chunks("doc", &[KnowledgeChunk::new(1, "doc", 0, "alpha".to_string())])
            .unwrap();
        assert_eq!(db.delete_chunks("doc").unwrap(), 1);
        assert!(db.list_chunks("doc").unwrap().is_empty());
    }

    #[test]
    fn test_manual_edits_keep_count_and_filter_search() {
        let db = KnowledgeDb::in_memory().unwrap();
        let file = embedded_file(&db, 1, "a.txt");
        db.replace_chunks(&file.uuid, &[KnowledgeChunk::new(file.id, &file.uuid, 0, "alpha".to_string())])
            .unwrap();

        let added = db
            .append_chunk(&KnowledgeChunk::new(file.id, &file.uuid, 0, "beta".to_string()), Some(&[1.0, 0.0]))
            .unwrap()
            .unwrap();
        assert_eq!(added.chunk_index, 1);
        assert!(added.embedded);
        assert_eq!(db.get_file_record(file.id).unwrap().unwrap().chunk_count, 2);
        assert_eq!(db.embedded_chunks(&[file.uuid.clone()]).unwrap().len(), 1);

        assert!(db.set_chunk_enabled(&added.id, file.id, false, None).unwrap());
        assert!(db.embedded_chunks(&[file.uuid.clone()]).unwrap().is_empty());
        assert!(!db.get_chunk(&added.id).unwrap().unwrap().enabled);

        let mut edited = db.get_chunk(&added.id).unwrap().unwrap();
        edited.content = "gamma".to_string();
        edited.enabled = true;
        assert!(db.update_chunk(&edited, Some(&[0.0, 1.0])).unwrap());
        let embedded = db.embedded_chunks(&[file.uuid.clone()]).unwrap();
        assert_eq!(embedded[0].0.content, "gamma");
        assert_eq!(embedded[0].1, vec![0.0, 1.0]);

        let page = db.list_chunks_page(&file.uuid, 1, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, added.id);

        assert!(db.delete_chunk(&added.id, file.id).unwrap());
        assert!(!db.delete_chunk(&added.id, file.id).unwrap());
        assert_eq!(db.get_file_record(file.id).unwrap().unwrap().chunk_count, 1);
    }

    #[test]
    fn test_edits_refused_once_file_leaves_embedded_state() {
        let db = KnowledgeDb::in_memory().unwrap();
        let file = embedded_file(&db, 1, "a.txt");
        let chunk = KnowledgeChunk::new(file.id, &file.uuid, 0, "alpha".to_string());
        db.replace_chunks(&file.uuid, &[chunk.clone()]).unwrap();

        db.begin_stage(file.id, FileStatus::sliceable(), FileStatus::Parsing, TaskStage::Parse, "u1", None)
            .unwrap()
            .unwrap();

        let extra = KnowledgeChunk::new(file.id, &file.uuid, 0, "beta".to_string());
        assert!(db.append_chunk(&extra, None).unwrap().is_none());
        assert!(!db.update_chunk(&chunk, None).unwrap());
        assert!(!db.set_chunk_enabled(&chunk.id, file.id, false, None).unwrap());
        assert!(!db.delete_chunk(&chunk.id, file.id).unwrap());
        assert_eq!(db.count_chunks(&file.uuid).unwrap(), 1);
    }
}
