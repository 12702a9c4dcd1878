//! Repository catalog: repositories, uploads, the folder tree, renames, enable/disable,
//! per-chunk edits and deletes

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ingestion::{check_file_type, file_extension, validate_node_name};
use crate::providers::{AccessPolicy, BackendRegistry, DocumentStoreProvider, ExtractionBackend};
use crate::storage::KnowledgeDb;
use crate::types::{
    Actor, BackendSource, ChunkPage, DirectoryNode, FileRecord, FileStatus, KnowledgeChunk,
    NewFileRecord, Repository, ROOT_PARENT_ID,
};

use super::arena::DirectoryArena;

/// Largest page a chunk listing returns
pub const MAX_CHUNK_PAGE_SIZE: u32 = 100;

/// What a delete removed
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteSummary {
    pub node_count: usize,
    pub file_ids: Vec<i64>,
}

/// Catalog operations over repositories and their directory trees
#[derive(Clone)]
pub struct Catalog {
    db: KnowledgeDb,
    backends: BackendRegistry,
    documents: Arc<dyn DocumentStoreProvider>,
    access: Arc<dyn AccessPolicy>,
}

impl Catalog {
    pub fn new(
        db: KnowledgeDb,
        backends: BackendRegistry,
        documents: Arc<dyn DocumentStoreProvider>,
        access: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            db,
            backends,
            documents,
            access,
        }
    }

    // ==================== Repositories ====================

    /// Names are unique per space, or per user outside a space
    pub fn create_repository(&self, name: &str, actor: &Actor) -> Result<Repository> {
        let name = validate_node_name(name)?;
        if self
            .db
            .find_repository_by_name(&name, &actor.user_id, actor.space_id)?
            .is_some()
        {
            return Err(Error::conflict(format!("Repository '{}' already exists", name)));
        }
        let repo = self.db.insert_repository(&name, &actor.user_id, actor.space_id)?;
        tracing::info!("Created repository {} '{}'", repo.id, repo.name);
        Ok(repo)
    }

    /// Repositories of the actor's space, or their personal ones, newest first
    pub fn list_repositories(&self, actor: &Actor) -> Result<Vec<Repository>> {
        self.db.list_repositories(&actor.user_id, actor.space_id)
    }

    pub fn rename_repository(&self, repo_id: i64, name: &str, actor: &Actor) -> Result<Repository> {
        let repo = self.get_repository(repo_id, actor)?;
        let name = validate_node_name(name)?;
        match self
            .db
            .find_repository_by_name(&name, &repo.owner_uid, repo.space_id)?
        {
            Some(existing) if existing != repo_id => {
                return Err(Error::conflict(format!("Repository '{}' already exists", name)));
            }
            _ => {}
        }
        if !self.db.rename_repository(repo_id, &name)? {
            return Err(Error::not_found(format!("Repository {}", repo_id)));
        }
        tracing::info!("Renamed repository {} to '{}'", repo_id, name);
        Ok(Repository { name, ..repo })
    }

    /// Delete a repository with its whole tree. Refused while any of its files is being
    /// parsed or embedded.
    pub async fn delete_repository(&self, repo_id: i64, actor: &Actor) -> Result<DeleteSummary> {
        self.get_repository(repo_id, actor)?;
        let node_ids: Vec<i64> = self
            .db
            .list_repo_nodes(repo_id)?
            .iter()
            .map(|n| n.id)
            .collect();
        let files = self.db.list_repo_files(repo_id)?;
        for file in &files {
            self.access.check_file(actor, file)?;
        }
        let file_ids: Vec<i64> = files.iter().map(|f| f.id).collect();

        self.db.soft_delete_files(&file_ids)?;
        let node_count = self.db.delete_nodes(&node_ids)?;
        self.db.mark_repository_deleted(repo_id)?;
        self.discard_derived(&files).await;

        tracing::info!(
            "Deleted repository {}: {} nodes, {} files",
            repo_id,
            node_count,
            files.len()
        );
        Ok(DeleteSummary { node_count, file_ids })
    }

    pub fn get_repository(&self, repo_id: i64, actor: &Actor) -> Result<Repository> {
        let repo = self
            .db
            .get_repository(repo_id)?
            .ok_or_else(|| Error::not_found(format!("Repository {}", repo_id)))?;
        self.access.check_repository(actor, &repo)?;
        Ok(repo)
    }

    // ==================== Upload ====================

    /// Validate, store and register an uploaded file. The record starts `Uploaded` with an
    /// invisible leaf node; it shows up in listings once embedding is requested.
    pub async fn upload_file(
        &self,
        repo_id: i64,
        parent_id: i64,
        file_name: &str,
        data: &[u8],
        source: BackendSource,
        actor: &Actor,
    ) -> Result<FileRecord> {
        let repo = self.get_repository(repo_id, actor)?;
        let name = validate_node_name(file_name)?;
        let file_type = file_extension(&name)?;
        check_file_type(&file_type)?;
        self.check_parent(repo_id, parent_id)?;

        let backend = self.backends.get(source)?;
        let char_count = backend.validate_upload(&name, &file_type, data)?;

        let mut record = FileRecord::uploaded(NewFileRecord {
            repo_id,
            owner_uid: actor.user_id.clone(),
            space_id: actor.space_id.or(repo.space_id),
            name: name.clone(),
            file_type: file_type.clone(),
            size: data.len() as u64,
            char_count,
            content_hash: hash_content(data),
            storage_key: String::new(),
            source,
        });

        let stored = self
            .documents
            .store_document(&record.uuid, &file_type, data)
            .await?;
        record.storage_key = stored.storage_key;

        let registered = self
            .db
            .insert_file_record(&record)
            .and_then(|id| {
                record.id = id;
                self.db.insert_node(repo_id, parent_id, &name, Some(id), false)
            });
        if let Err(e) = registered {
            if record.id > 0 {
                self.db.soft_delete_files(&[record.id])?;
            }
            if let Err(cleanup) = self.documents.delete_document(&record.storage_key).await {
                tracing::warn!("Failed to discard upload {}: {}", record.storage_key, cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            "[file {}] Uploaded '{}' ({} bytes, {} characters) to repository {} via {}",
            record.id,
            record.name,
            record.size,
            record.char_count,
            repo_id,
            source.as_str()
        );
        Ok(record)
    }

    // ==================== Directory tree ====================

    pub fn create_folder(
        &self,
        repo_id: i64,
        parent_id: i64,
        name: &str,
        actor: &Actor,
    ) -> Result<DirectoryNode> {
        self.get_repository(repo_id, actor)?;
        let name = validate_node_name(name)?;
        self.check_parent(repo_id, parent_id)?;
        self.db.insert_node(repo_id, parent_id, &name, None, true)
    }

    pub fn rename_folder(&self, node_id: i64, name: &str, actor: &Actor) -> Result<DirectoryNode> {
        let node = self.load_node(node_id, actor)?;
        if node.is_file {
            return Err(Error::validation(format!("Node {} is a file", node_id)));
        }
        let name = validate_node_name(name)?;
        self.db.rename_node(node_id, &name)?;
        Ok(DirectoryNode { name, ..node })
    }

    /// Rename a file's node and its record's display name
    pub fn rename_file(&self, node_id: i64, name: &str, actor: &Actor) -> Result<DirectoryNode> {
        let (node, file) = self.load_file_node(node_id, actor)?;
        let name = validate_node_name(name)?;
        self.db.rename_node(node_id, &name)?;
        self.db.rename_file(file.id, &name)?;
        Ok(DirectoryNode { name, ..node })
    }

    /// Visible children of a folder, folders first then by name
    pub fn list_children(&self, repo_id: i64, parent_id: i64, actor: &Actor) -> Result<Vec<DirectoryNode>> {
        self.get_repository(repo_id, actor)?;
        self.db.list_children(repo_id, parent_id)
    }

    /// Breadcrumb from the top-level folder down to the node
    pub fn path_to_root(&self, node_id: i64, actor: &Actor) -> Result<Vec<DirectoryNode>> {
        let node = self.load_node(node_id, actor)?;
        let arena = DirectoryArena::new(self.db.list_repo_nodes(node.repo_id)?);
        Ok(arena.path_to_root(node_id).into_iter().cloned().collect())
    }

    pub async fn delete_folder(&self, node_id: i64, actor: &Actor) -> Result<DeleteSummary> {
        let node = self.load_node(node_id, actor)?;
        if node.is_file {
            return Err(Error::validation(format!("Node {} is a file", node_id)));
        }
        self.delete_subtree(&node, actor).await
    }

    pub async fn delete_file(&self, node_id: i64, actor: &Actor) -> Result<DeleteSummary> {
        let (node, _) = self.load_file_node(node_id, actor)?;
        self.delete_subtree(&node, actor).await
    }

    /// Toggle whether a file takes part in hit tests
    pub fn set_file_enabled(&self, node_id: i64, enabled: bool, actor: &Actor) -> Result<FileRecord> {
        let (_, file) = self.load_file_node(node_id, actor)?;
        if enabled && file.status != FileStatus::EmbeddingSucceeded {
            return Err(Error::validation(format!(
                "File {} cannot be enabled while {}",
                file.id,
                file.status.as_str()
            )));
        }
        if !self.db.set_file_enabled(file.id, enabled)? {
            return Err(Error::conflict(format!(
                "File {} changed state, please retry",
                file.id
            )));
        }
        tracing::info!("[file {}] {}", file.id, if enabled { "Enabled" } else { "Disabled" });
        self.db
            .get_file_record(file.id)?
            .ok_or_else(|| Error::not_found(format!("File {}", file.id)))
    }

    // ==================== Chunks ====================

    /// One page of a file's chunks, `page` starting at 1
    pub async fn list_file_chunks(
        &self,
        node_id: i64,
        page: u32,
        page_size: u32,
        actor: &Actor,
    ) -> Result<ChunkPage> {
        let (_, file) = self.load_file_node(node_id, actor)?;
        let backend = self.backends.for_file(&file)?;
        backend
            .list_chunks(&file, page.max(1), page_size.clamp(1, MAX_CHUNK_PAGE_SIZE))
            .await
    }

    pub async fn add_chunk(&self, node_id: i64, content: &str, actor: &Actor) -> Result<KnowledgeChunk> {
        let (file, backend) = self.editable_file(node_id, actor)?;
        backend.add_chunk(&file, content).await
    }

    pub async fn update_chunk(
        &self,
        node_id: i64,
        chunk_id: &str,
        content: &str,
        actor: &Actor,
    ) -> Result<KnowledgeChunk> {
        let (file, backend) = self.editable_file(node_id, actor)?;
        backend.update_chunk(&file, chunk_id, content).await
    }

    pub async fn set_chunk_enabled(
        &self,
        node_id: i64,
        chunk_id: &str,
        enabled: bool,
        actor: &Actor,
    ) -> Result<KnowledgeChunk> {
        let (file, backend) = self.editable_file(node_id, actor)?;
        backend.set_chunk_enabled(&file, chunk_id, enabled).await
    }

    pub async fn delete_chunk(&self, node_id: i64, chunk_id: &str, actor: &Actor) -> Result<()> {
        let (file, backend) = self.editable_file(node_id, actor)?;
        backend.delete_chunk(&file, chunk_id).await
    }

    // ==================== Helpers ====================

    /// Chunks are edited only on embedded files; the backend re-checks under its own lock
    fn editable_file(
        &self,
        node_id: i64,
        actor: &Actor,
    ) -> Result<(FileRecord, Arc<dyn ExtractionBackend>)> {
        let (_, file) = self.load_file_node(node_id, actor)?;
        if file.status.is_in_flight() {
            return Err(Error::conflict(format!(
                "File {} is being processed, try again later",
                file.id
            )));
        }
        if file.status != FileStatus::EmbeddingSucceeded {
            return Err(Error::validation(format!(
                "Chunks of file {} can only be edited once it is embedded, it is {}",
                file.id,
                file.status.as_str()
            )));
        }
        let backend = self.backends.for_file(&file)?;
        Ok((file, backend))
    }

    fn check_parent(&self, repo_id: i64, parent_id: i64) -> Result<()> {
        if parent_id == ROOT_PARENT_ID {
            return Ok(());
        }
        match self.db.get_node(parent_id)? {
            Some(parent) if parent.repo_id == repo_id && !parent.is_file => Ok(()),
            Some(_) => Err(Error::validation(format!(
                "Node {} is not a folder of repository {}",
                parent_id, repo_id
            ))),
            None => Err(Error::not_found(format!("Folder {}", parent_id))),
        }
    }

    fn load_node(&self, node_id: i64, actor: &Actor) -> Result<DirectoryNode> {
        let node = self
            .db
            .get_node(node_id)?
            .ok_or_else(|| Error::not_found(format!("Node {}", node_id)))?;
        self.get_repository(node.repo_id, actor)?;
        Ok(node)
    }

    fn load_file_node(&self, node_id: i64, actor: &Actor) -> Result<(DirectoryNode, FileRecord)> {
        let node = self.load_node(node_id, actor)?;
        let file_id = node
            .file_id
            .ok_or_else(|| Error::validation(format!("Node {} is a folder", node_id)))?;
        let file = self
            .db
            .get_file_record(file_id)?
            .filter(|f| !f.deleted)
            .ok_or_else(|| Error::not_found(format!("File {}", file_id)))?;
        self.access.check_file(actor, &file)?;
        Ok((node, file))
    }

    /// Delete a node and everything below it. Files with a live stage are refused so a
    /// worker never writes chunks for a deleted record.
    async fn delete_subtree(&self, root: &DirectoryNode, actor: &Actor) -> Result<DeleteSummary> {
        let arena = DirectoryArena::new(self.db.list_repo_nodes(root.repo_id)?);
        let nodes = arena.collect_descendants(root.id);
        let node_ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
        let file_ids: Vec<i64> = nodes.iter().filter_map(|n| n.file_id).collect();

        let files = self.db.get_file_records(&file_ids)?;
        for file in &files {
            self.access.check_file(actor, file)?;
        }

        // The status guard lives in the delete itself; a stage that started after the
        // read above still refuses the whole subtree.
        self.db.soft_delete_files(&file_ids)?;
        let node_count = self.db.delete_nodes(&node_ids)?;
        self.discard_derived(&files).await;

        tracing::info!(
            "Deleted node {} of repository {}: {} nodes, {} files",
            root.id,
            root.repo_id,
            node_count,
            files.len()
        );
        Ok(DeleteSummary {
            node_count,
            file_ids: files.iter().map(|f| f.id).collect(),
        })
    }

    /// Derived data and stored bytes are best-effort once the records are gone
    async fn discard_derived(&self, files: &[FileRecord]) {
        for file in files {
            match self.backends.for_file(file) {
                Ok(backend) => {
                    if let Err(e) = backend.remove(file).await {
                        tracing::warn!("[file {}] Failed to remove indexed chunks: {}", file.id, e);
                    }
                }
                Err(e) => tracing::warn!("[file {}] No backend to clean up: {}", file.id, e),
            }
            if let Err(e) = self.documents.delete_document(&file.storage_key).await {
                tracing::warn!("[file {}] Failed to delete stored bytes: {}", file.id, e);
            }
        }
    }
}

fn hash_content(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
