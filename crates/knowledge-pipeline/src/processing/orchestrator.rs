//! Pipeline orchestrator: batch slice / embed / retry over the per-file state machine
//!
//! Every worker opens its ledger row and moves the file into a working status in one
//! compare-and-set before any backend call, and closes the row only after the file record
//! has been updated. A crash anywhere in between leaves a `pending` row for recovery.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{ProcessingConfig, SlicingConfig};
use crate::error::{Error, Result};
use crate::providers::{AccessPolicy, BackendRegistry, EmbedOutcome, ExtractOutcome, ExtractionBackend};
use crate::storage::KnowledgeDb;
use crate::types::{
    Actor, EmbedDispatch, FileOutcome, FileRecord, FileStatus, IndexingStatus, Repository,
    RetryOutcome, SliceConfig, SliceOutcome, TaskStage, TaskStatus, ROOT_PARENT_ID,
};

use super::worker::{StageSignals, WorkTracker};

/// Drives files through slicing and embedding
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    db: KnowledgeDb,
    backends: BackendRegistry,
    access: Arc<dyn AccessPolicy>,
    slicing: SlicingConfig,
    processing: ProcessingConfig,
    signals: StageSignals,
    tracker: Arc<WorkTracker>,
}

impl PipelineOrchestrator {
    pub fn new(
        db: KnowledgeDb,
        backends: BackendRegistry,
        access: Arc<dyn AccessPolicy>,
        slicing: SlicingConfig,
        processing: ProcessingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                db,
                backends,
                access,
                slicing,
                processing,
                signals: StageSignals::new(),
                tracker: Arc::new(WorkTracker::new()),
            }),
        }
    }

    pub fn db(&self) -> &KnowledgeDb {
        &self.inner.db
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.inner.backends
    }

    pub fn tracker(&self) -> &WorkTracker {
        &self.inner.tracker
    }

    /// Resolve once every fire-and-forget worker has finished
    pub async fn wait_idle(&self) {
        self.inner.tracker.wait_idle().await;
    }

    // ==================== Public operations ====================

    /// Slice a batch of files, one worker per file, returning once every worker is done.
    ///
    /// Validation covers the whole batch before anything is touched. Files already owned
    /// by a worker are reported as conflicts; the call only fails as a whole when no file
    /// could be dispatched. Workers run on their own tasks, so dropping this future leaves
    /// them running to completion.
    pub async fn slice_files(
        &self,
        repo_id: i64,
        file_ids: &[i64],
        slice_config: &SliceConfig,
        actor: &Actor,
    ) -> Result<SliceOutcome> {
        self.load_repository(repo_id, actor)?;
        let files = self.load_files(repo_id, file_ids, actor)?;
        let config = slice_config.resolved(&self.inner.slicing.default_slice_config());

        let mut plans = Vec::with_capacity(files.len());
        for file in files {
            let backend = self.inner.backends.for_file(&file)?;
            backend.validate_slice(&file, &config)?;
            plans.push((file, backend));
        }

        let mut outcomes = Vec::with_capacity(plans.len());
        let mut conflicts = 0;
        let mut workers = Vec::new();

        for (file, backend) in plans {
            if file.status.is_in_flight() {
                conflicts += 1;
                outcomes.push(FileOutcome::rejected(file.id, in_progress_message(&file)));
                continue;
            }

            match self.inner.db.begin_stage(
                file.id,
                FileStatus::sliceable(),
                FileStatus::Parsing,
                TaskStage::Parse,
                &actor.user_id,
                Some(&config),
            ) {
                Ok(Some(task_id)) => {
                    self.ensure_node(&file);
                    let file_id = file.id;
                    let handle = self.spawn_parse(file, backend, config.clone(), task_id, None);
                    workers.push((file_id, handle));
                }
                Ok(None) => {
                    conflicts += 1;
                    outcomes.push(FileOutcome::rejected(
                        file.id,
                        format!("File {} is currently being processed, please wait", file.id),
                    ));
                }
                Err(e) => {
                    tracing::error!("[file {}] Failed to start slicing: {}", file.id, e);
                    outcomes.push(FileOutcome::rejected(file.id, e.to_string()));
                }
            }
        }

        if workers.is_empty() {
            let errors = joined_errors(&outcomes);
            return Err(if conflicts == outcomes.len() {
                Error::conflict(errors)
            } else {
                Error::AllFailed(errors)
            });
        }

        outcomes.extend(collect_workers(workers).await);
        let outcome = SliceOutcome::from_files(outcomes);
        tracing::info!(
            "Slice batch for repository {}: {} succeeded, {} failed",
            repo_id,
            outcome.succeeded,
            outcome.failed
        );
        Ok(outcome)
    }

    /// Embed a batch of files.
    ///
    /// Files still being sliced are waited on. With `background` the workers are spawned
    /// and the call returns immediately; otherwise it returns once they finish. Either way
    /// the workers run on their own tasks and outlive a dropped caller.
    pub async fn embed_files(
        &self,
        repo_id: i64,
        file_ids: &[i64],
        background: bool,
        actor: &Actor,
    ) -> Result<EmbedDispatch> {
        self.load_repository(repo_id, actor)?;
        let files = self.load_files(repo_id, file_ids, actor)?;

        for file in &files {
            if matches!(file.status, FileStatus::Uploaded | FileStatus::ParseFailed) {
                return Err(Error::validation(format!(
                    "File {} has not been sliced successfully (status {})",
                    file.id, file.status
                )));
            }
            self.inner.backends.for_file(file)?;
        }

        let mut dispatch = EmbedDispatch::default();
        let mut workers = Vec::new();

        for file in files {
            if file.status == FileStatus::Embedding {
                dispatch.rejected.push(FileOutcome::rejected(file.id, in_progress_message(&file)));
                continue;
            }

            // Record the request now if it has to wait for the parse to resolve
            let waiting_task = if file.status == FileStatus::Parsing {
                match self.inner.db.begin_task(file.id, file.repo_id, TaskStage::Embed, &actor.user_id) {
                    Ok(task_id) => Some(task_id),
                    Err(e) => {
                        tracing::error!("[file {}] Failed to record embed request: {}", file.id, e);
                        dispatch.rejected.push(FileOutcome::rejected(file.id, e.to_string()));
                        continue;
                    }
                }
            } else {
                None
            };

            if let Err(e) = self.inner.db.set_file_node_visible(file.id) {
                tracing::warn!("[file {}] Failed to show directory node: {}", file.id, e);
            }

            dispatch.accepted.push(file.id);
            let handle = self.spawn_embed(file.id, actor.user_id.clone(), waiting_task);
            if !background {
                workers.push((file.id, handle));
            }
        }

        if dispatch.accepted.is_empty() {
            return Err(Error::conflict(joined_errors(&dispatch.rejected)));
        }

        dispatch.files = collect_workers(workers).await;
        Ok(dispatch)
    }

    /// Re-drive failed files. `PARSE_FAILED` files are sliced again and chained into
    /// embedding, `EMBEDDING_FAILED` files only re-run embedding, anything else is left
    /// alone. Workers run in the background.
    pub async fn retry(
        &self,
        repo_id: i64,
        file_ids: &[i64],
        slice_config: Option<&SliceConfig>,
        actor: &Actor,
    ) -> Result<RetryOutcome> {
        self.load_repository(repo_id, actor)?;
        let files = self.load_files(repo_id, file_ids, actor)?;
        let defaults = self.inner.slicing.default_slice_config();

        let mut plans = Vec::with_capacity(files.len());
        for file in files {
            let reslice = if file.status == FileStatus::ParseFailed {
                let requested = slice_config
                    .cloned()
                    .or_else(|| file.slice_config.clone())
                    .unwrap_or_else(|| defaults.clone());
                let config = requested.resolved(&defaults);
                let backend = self.inner.backends.for_file(&file)?;
                backend.validate_slice(&file, &config)?;
                Some((backend, config))
            } else {
                None
            };
            plans.push((file, reslice));
        }

        let mut outcome = RetryOutcome::default();
        for (file, reslice) in plans {
            match (file.status, reslice) {
                (FileStatus::ParseFailed, Some((backend, config))) => {
                    match self.inner.db.begin_stage(
                        file.id,
                        &[FileStatus::ParseFailed],
                        FileStatus::Parsing,
                        TaskStage::Parse,
                        &actor.user_id,
                        Some(&config),
                    ) {
                        Ok(Some(task_id)) => {
                            tracing::info!("[file {}] Retrying slice", file.id);
                            outcome.reparsed.push(file.id);
                            self.spawn_parse(file, backend, config, task_id, Some(actor.user_id.clone()));
                        }
                        Ok(None) => outcome.skipped.push(file.id),
                        Err(e) => {
                            tracing::error!("[file {}] Failed to restart slicing: {}", file.id, e);
                            outcome.skipped.push(file.id);
                        }
                    }
                }
                (FileStatus::EmbeddingFailed, _) => {
                    match self.inner.db.transition_status(
                        file.id,
                        &[FileStatus::EmbeddingFailed],
                        FileStatus::ParseSucceeded,
                        None,
                    ) {
                        Ok(true) => {
                            tracing::info!("[file {}] Retrying embedding", file.id);
                            outcome.reembedded.push(file.id);
                            self.spawn_embed(file.id, actor.user_id.clone(), None);
                        }
                        Ok(false) => outcome.skipped.push(file.id),
                        Err(e) => {
                            tracing::error!("[file {}] Failed to rewind for embedding: {}", file.id, e);
                            outcome.skipped.push(file.id);
                        }
                    }
                }
                _ => outcome.skipped.push(file.id),
            }
        }

        Ok(outcome)
    }

    /// Read-only status projection; unknown or deleted ids are omitted
    pub fn get_indexing_status(&self, file_ids: &[i64], actor: &Actor) -> Result<Vec<IndexingStatus>> {
        let records = self.inner.db.get_file_records(file_ids)?;
        let mut statuses = Vec::with_capacity(records.len());
        for file in records {
            self.inner.access.check_file(actor, &file)?;
            statuses.push(IndexingStatus {
                file_id: file.id,
                status: file.status,
                chunk_count: file.chunk_count,
                failed_chunk_count: file.failed_chunk_count,
                enabled: file.enabled,
                reason: file.reason,
            });
        }
        Ok(statuses)
    }

    // ==================== Workers ====================

    fn spawn_parse(
        &self,
        file: FileRecord,
        backend: Arc<dyn ExtractionBackend>,
        config: SliceConfig,
        task_id: i64,
        chain_owner: Option<String>,
    ) -> JoinHandle<FileOutcome> {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.run_parse(file, backend, config, task_id, chain_owner)
                .await
        })
    }

    fn spawn_embed(
        &self,
        file_id: i64,
        owner_uid: String,
        waiting_task: Option<i64>,
    ) -> JoinHandle<FileOutcome> {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.run_embed(file_id, owner_uid, waiting_task).await
        })
    }

    /// Slice one file. With `chain_owner` set, a successful slice continues into embedding.
    async fn run_parse(
        &self,
        file: FileRecord,
        backend: Arc<dyn ExtractionBackend>,
        config: SliceConfig,
        task_id: i64,
        chain_owner: Option<String>,
    ) -> FileOutcome {
        let _guard = self.inner.tracker.enter(file.id, TaskStage::Parse);
        tracing::info!(
            "[file {}] Slicing '{}' via {} (range {:?})",
            file.id,
            file.name,
            backend.name(),
            config.length_range
        );

        let outcome = match backend.extract(&file, &config).await {
            Ok(extracted) if extracted.chunk_count == 0 => {
                self.fail_parse(&file, task_id, unchunkable_message(&file))
            }
            Ok(extracted) => self.finish_parse(&file, task_id, extracted),
            Err(e) => self.fail_parse(&file, task_id, format!("Document chunking failed, {}", e)),
        };
        self.inner.signals.notify(file.id);

        if let Some(owner) = chain_owner {
            if outcome.status == Some(FileStatus::ParseSucceeded) {
                self.spawn_embed(file.id, owner, None);
            }
        }
        outcome
    }

    fn finish_parse(&self, file: &FileRecord, task_id: i64, extracted: ExtractOutcome) -> FileOutcome {
        match self
            .inner
            .db
            .complete_parse(file.id, extracted.chunk_count, extracted.char_count)
        {
            Ok(true) => {
                self.close_task(file.id, task_id, TaskStatus::Done, None);
                tracing::info!("[file {}] Sliced into {} chunks", file.id, extracted.chunk_count);
                FileOutcome {
                    file_id: file.id,
                    dispatched: true,
                    status: Some(FileStatus::ParseSucceeded),
                    chunk_count: Some(extracted.chunk_count),
                    error: None,
                }
            }
            Ok(false) => {
                let reason = "File record changed while slicing; result discarded";
                tracing::warn!("[file {}] {}", file.id, reason);
                self.close_task(file.id, task_id, TaskStatus::Failed, Some(reason));
                dispatched_failure(file.id, None, reason.to_string())
            }
            Err(e) => {
                // Ledger row stays pending for recovery
                tracing::error!("[file {}] Failed to persist slice result: {}", file.id, e);
                dispatched_failure(file.id, None, e.to_string())
            }
        }
    }

    fn fail_parse(&self, file: &FileRecord, task_id: i64, reason: String) -> FileOutcome {
        tracing::warn!("[file {}] {}", file.id, reason);
        match self.inner.db.transition_status(
            file.id,
            &[FileStatus::Parsing],
            FileStatus::ParseFailed,
            Some(&reason),
        ) {
            Ok(_) => self.close_task(file.id, task_id, TaskStatus::Failed, Some(&reason)),
            Err(e) => tracing::error!("[file {}] Failed to record slice failure: {}", file.id, e),
        }
        dispatched_failure(file.id, Some(FileStatus::ParseFailed), reason)
    }

    /// Embed one file, first waiting for any slice in flight to resolve
    async fn run_embed(&self, file_id: i64, owner_uid: String, waiting_task: Option<i64>) -> FileOutcome {
        let _guard = self.inner.tracker.enter(file_id, TaskStage::Embed);

        let file = match self.wait_for_parse(file_id, waiting_task).await {
            Ok(file) => file,
            Err(outcome) => return outcome,
        };

        let backend = match self.inner.backends.for_file(&file) {
            Ok(backend) => backend,
            Err(e) => return FileOutcome::rejected(file_id, e.to_string()),
        };

        let task_id = match self.inner.db.begin_stage(
            file.id,
            FileStatus::embeddable(),
            FileStatus::Embedding,
            TaskStage::Embed,
            &owner_uid,
            None,
        ) {
            Ok(Some(task_id)) => task_id,
            Ok(None) => return FileOutcome::rejected(file_id, in_progress_message(&file)),
            Err(e) => {
                tracing::error!("[file {}] Failed to start embedding: {}", file_id, e);
                return FileOutcome::rejected(file_id, e.to_string());
            }
        };

        tracing::info!(
            "[file {}] Embedding {} chunks via {}",
            file.id,
            file.chunk_count,
            backend.name()
        );
        let outcome = match backend.embed(&file).await {
            Ok(embedded) => self.finish_embed(&file, task_id, embedded),
            Err(e) => self.fail_embed(&file, task_id, format!("File embedding failed: {}", e)),
        };
        self.inner.signals.notify(file.id);
        outcome
    }

    /// Wait until the file leaves `PARSING`. Returns the fresh record when embedding may
    /// proceed, or the outcome to report when it may not.
    async fn wait_for_parse(
        &self,
        file_id: i64,
        waiting_task: Option<i64>,
    ) -> std::result::Result<FileRecord, FileOutcome> {
        let signals = &self.inner.signals;
        let generation = signals.claim(file_id);
        let notify = signals.subscribe(file_id);

        let max_delay = Duration::from_millis(self.inner.processing.wait_max_ms.max(1));
        let mut delay = Duration::from_millis(self.inner.processing.wait_initial_ms.max(1)).min(max_delay);

        let result = loop {
            let changed = notify.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if !signals.is_current(file_id, generation) {
                tracing::debug!("[file {}] Embed wait superseded by a newer request", file_id);
                break Err(FileOutcome::rejected(file_id, "Superseded by a newer embed request"));
            }

            let file = match self.inner.db.get_file_record(file_id) {
                Ok(Some(file)) if !file.deleted => file,
                Ok(_) => {
                    let reason = format!("File {} no longer exists", file_id);
                    if let Some(task_id) = waiting_task {
                        self.close_task(file_id, task_id, TaskStatus::Failed, Some(&reason));
                    }
                    break Err(FileOutcome::rejected(file_id, reason));
                }
                Err(e) => {
                    tracing::error!("[file {}] Failed to read status while waiting: {}", file_id, e);
                    break Err(FileOutcome::rejected(file_id, e.to_string()));
                }
            };

            match file.status {
                FileStatus::Parsing => {
                    tokio::select! {
                        _ = &mut changed => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(max_delay);
                }
                FileStatus::Uploaded | FileStatus::ParseFailed => {
                    let reason = format!("File {} was not sliced successfully; embedding skipped", file_id);
                    if let Some(task_id) = waiting_task {
                        self.close_task(file_id, task_id, TaskStatus::Failed, Some(&reason));
                    }
                    break Err(dispatched_failure(file_id, Some(file.status), reason));
                }
                _ => break Ok(file),
            }
        };

        signals.release(file_id, generation);
        result
    }

    fn finish_embed(&self, file: &FileRecord, task_id: i64, embedded: EmbedOutcome) -> FileOutcome {
        match self.inner.db.complete_embed(file.id, embedded.failed) {
            Ok(true) => {
                let message = (embedded.failed > 0).then(|| {
                    format!(
                        "{} of {} chunks failed to embed",
                        embedded.failed,
                        embedded.failed + embedded.embedded
                    )
                });
                self.close_task(file.id, task_id, TaskStatus::Done, message.as_deref());
                tracing::info!(
                    "[file {}] Embedded {} chunks ({} failed)",
                    file.id,
                    embedded.embedded,
                    embedded.failed
                );
                FileOutcome {
                    file_id: file.id,
                    dispatched: true,
                    status: Some(FileStatus::EmbeddingSucceeded),
                    chunk_count: Some(file.chunk_count),
                    error: None,
                }
            }
            Ok(false) => {
                let reason = "File record changed while embedding; result discarded";
                tracing::warn!("[file {}] {}", file.id, reason);
                self.close_task(file.id, task_id, TaskStatus::Failed, Some(reason));
                dispatched_failure(file.id, None, reason.to_string())
            }
            Err(e) => {
                tracing::error!("[file {}] Failed to persist embed result: {}", file.id, e);
                dispatched_failure(file.id, None, e.to_string())
            }
        }
    }

    fn fail_embed(&self, file: &FileRecord, task_id: i64, reason: String) -> FileOutcome {
        tracing::warn!("[file {}] {}", file.id, reason);
        match self.inner.db.transition_status(
            file.id,
            &[FileStatus::Embedding],
            FileStatus::EmbeddingFailed,
            Some(&reason),
        ) {
            Ok(_) => self.close_task(file.id, task_id, TaskStatus::Failed, Some(&reason)),
            Err(e) => tracing::error!("[file {}] Failed to record embed failure: {}", file.id, e),
        }
        dispatched_failure(file.id, Some(FileStatus::EmbeddingFailed), reason)
    }

    // ==================== Helpers ====================

    fn close_task(&self, file_id: i64, task_id: i64, status: TaskStatus, message: Option<&str>) {
        if let Err(e) = self.inner.db.complete_task(task_id, status, message) {
            tracing::error!("[file {}] Failed to close task {}: {}", file_id, task_id, e);
        }
    }

    fn load_repository(&self, repo_id: i64, actor: &Actor) -> Result<Repository> {
        let repo = self
            .inner
            .db
            .get_repository(repo_id)?
            .ok_or_else(|| Error::not_found(format!("Repository {}", repo_id)))?;
        self.inner.access.check_repository(actor, &repo)?;
        Ok(repo)
    }

    /// Live records of the batch, in request order with duplicates dropped
    fn load_files(&self, repo_id: i64, file_ids: &[i64], actor: &Actor) -> Result<Vec<FileRecord>> {
        if file_ids.is_empty() {
            return Err(Error::validation("No files given"));
        }

        let mut files: Vec<FileRecord> = Vec::with_capacity(file_ids.len());
        for &id in file_ids {
            if files.iter().any(|f| f.id == id) {
                continue;
            }
            let file = self
                .inner
                .db
                .get_file_record(id)?
                .filter(|f| !f.deleted && f.repo_id == repo_id)
                .ok_or_else(|| Error::not_found(format!("File {} in repository {}", id, repo_id)))?;
            self.inner.access.check_file(actor, &file)?;
            files.push(file);
        }
        Ok(files)
    }

    /// Files sliced without going through upload get a hidden leaf at the root
    fn ensure_node(&self, file: &FileRecord) {
        let result = match self.inner.db.node_for_file(file.id) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self
                .inner
                .db
                .insert_node(file.repo_id, ROOT_PARENT_ID, &file.name, Some(file.id), false)
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("[file {}] Failed to ensure directory node: {}", file.id, e);
        }
    }
}

fn in_progress_message(file: &FileRecord) -> String {
    match file.status {
        FileStatus::Embedding => format!("File {} is currently being embedded, please wait", file.id),
        _ => format!("File {} is currently being split, please wait", file.id),
    }
}

fn unchunkable_message(file: &FileRecord) -> String {
    if file.is_image() {
        "Image cannot be chunked, please check if the image meets upload requirements".to_string()
    } else {
        "Document cannot be chunked, please check if the file meets upload requirements".to_string()
    }
}

fn dispatched_failure(file_id: i64, status: Option<FileStatus>, error: String) -> FileOutcome {
    FileOutcome {
        file_id,
        dispatched: true,
        status,
        chunk_count: None,
        error: Some(error),
    }
}

/// Await spawned workers in dispatch order. A worker that panicked is reported as a
/// failure of its file; its ledger row stays pending for recovery.
async fn collect_workers(workers: Vec<(i64, JoinHandle<FileOutcome>)>) -> Vec<FileOutcome> {
    join_all(workers.into_iter().map(|(file_id, handle)| async move {
        handle.await.unwrap_or_else(|e| {
            tracing::error!("[file {}] Worker stopped: {}", file_id, e);
            dispatched_failure(file_id, None, format!("Worker stopped: {}", e))
        })
    }))
    .await
}

fn joined_errors(outcomes: &[FileOutcome]) -> String {
    outcomes
        .iter()
        .filter_map(|o| o.error.as_deref())
        .collect::<Vec<_>>()
        .join("; ")
}
