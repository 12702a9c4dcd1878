//! Recovery sweeper: re-drives ledger entries orphaned by a crash or a stuck worker
//!
//! Only the latest pending entry per file is considered; older ones are closed as
//! superseded. Re-drives go through the orchestrator's public `retry` and `embed_files`
//! so validation still applies.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Actor, FileStatus, ProcessingTask, TaskStage, TaskStatus};

use super::orchestrator::PipelineOrchestrator;

/// What a sweep did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Files sent back into the pipeline
    pub redriven: Vec<i64>,
    /// Ledger entries closed without a re-drive
    pub closed: Vec<i64>,
    /// Older duplicates closed in favour of a newer entry
    pub superseded: Vec<i64>,
}

/// What to do with the latest pending entry of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Close(TaskStatus, &'static str),
    Reslice,
    Reembed { rewind: bool },
}

fn decide(stage: TaskStage, status: FileStatus) -> Action {
    use FileStatus::*;
    match (stage, status) {
        (_, EmbeddingSucceeded) => Action::Close(TaskStatus::Done, "file already embedded"),
        (_, ParseFailed) | (_, EmbeddingFailed) => {
            Action::Close(TaskStatus::Failed, "file already failed")
        }
        (TaskStage::Parse, ParseSucceeded) | (TaskStage::Parse, Embedding) => {
            Action::Close(TaskStatus::Done, "file already sliced")
        }
        (_, Uploaded) => Action::Close(TaskStatus::Failed, "file was never sliced"),
        (_, Parsing) => Action::Reslice,
        (TaskStage::Embed, Embedding) => Action::Reembed { rewind: true },
        (TaskStage::Embed, ParseSucceeded) => Action::Reembed { rewind: false },
    }
}

/// Scans the task ledger for orphaned work
#[derive(Clone)]
pub struct RecoverySweeper {
    orchestrator: PipelineOrchestrator,
    liveness: ChronoDuration,
}

impl RecoverySweeper {
    pub fn new(orchestrator: PipelineOrchestrator, liveness_secs: u64) -> Self {
        Self {
            orchestrator,
            liveness: ChronoDuration::seconds(liveness_secs as i64),
        }
    }

    /// Startup sweep: nothing can be running yet, so every pending entry is orphaned
    pub async fn sweep_startup(&self) -> Result<RecoveryReport> {
        let pending = self.orchestrator.db().pending_tasks()?;
        tracing::info!("Recovery: {} pending ledger entries at startup", pending.len());
        self.recover(pending).await
    }

    /// Periodic sweep: entries idle past the liveness threshold whose file has no live worker
    pub async fn sweep_stale(&self) -> Result<RecoveryReport> {
        let cutoff = Utc::now() - self.liveness;
        let tracker = self.orchestrator.tracker();
        let stale: Vec<ProcessingTask> = self
            .orchestrator
            .db()
            .pending_tasks()?
            .into_iter()
            .filter(|t| t.updated_at < cutoff && !tracker.file_busy(t.file_id))
            .collect();
        if !stale.is_empty() {
            tracing::info!("Recovery: {} stale ledger entries", stale.len());
        }
        self.recover(stale).await
    }

    /// Run `sweep_stale` on a timer until the process exits
    pub fn spawn_periodic(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_stale().await {
                    tracing::error!("Recovery sweep failed: {}", e);
                }
            }
        })
    }

    async fn recover(&self, pending: Vec<ProcessingTask>) -> Result<RecoveryReport> {
        let db = self.orchestrator.db();
        let mut report = RecoveryReport::default();

        let mut by_file: HashMap<i64, Vec<ProcessingTask>> = HashMap::new();
        for task in pending {
            by_file.entry(task.file_id).or_default().push(task);
        }

        let mut file_ids: Vec<i64> = by_file.keys().copied().collect();
        file_ids.sort_unstable();

        for file_id in file_ids {
            let Some(mut tasks) = by_file.remove(&file_id) else {
                continue;
            };
            tasks.sort_by_key(|t| (t.updated_at, t.id));
            let Some(latest) = tasks.pop() else {
                continue;
            };

            for older in tasks {
                db.complete_task(older.id, TaskStatus::Failed, Some("superseded"))?;
                report.superseded.push(older.id);
            }

            let file = match db.get_file_record(file_id)? {
                Some(file) if !file.deleted => file,
                _ => {
                    db.complete_task(latest.id, TaskStatus::Failed, Some("file deleted"))?;
                    report.closed.push(latest.id);
                    continue;
                }
            };

            match decide(latest.stage, file.status) {
                Action::Close(status, message) => {
                    tracing::debug!(
                        "[file {}] Recovery: closing {} entry {} ({})",
                        file_id,
                        latest.stage.as_str(),
                        latest.id,
                        message
                    );
                    db.complete_task(latest.id, status, Some(message))?;
                    report.closed.push(latest.id);
                }
                Action::Reslice => {
                    db.transition_status(
                        file_id,
                        &[FileStatus::Parsing],
                        FileStatus::ParseFailed,
                        Some("interrupted"),
                    )?;
                    let redrive = self
                        .orchestrator
                        .retry(file.repo_id, &[file_id], None, &Actor::system())
                        .await;
                    match redrive {
                        Ok(outcome) if outcome.reparsed.contains(&file_id) => {
                            tracing::info!("[file {}] Recovery: slicing re-driven", file_id);
                            if latest.stage == TaskStage::Embed {
                                // The chained embed opens its own entry
                                db.complete_task(latest.id, TaskStatus::Failed, Some("interrupted"))?;
                            }
                            report.redriven.push(file_id);
                        }
                        Ok(_) => {
                            db.complete_task(latest.id, TaskStatus::Failed, Some("not re-driven"))?;
                            report.closed.push(latest.id);
                        }
                        Err(e) => {
                            tracing::warn!("[file {}] Recovery: re-slice rejected: {}", file_id, e);
                            db.complete_task(latest.id, TaskStatus::Failed, Some(&e.to_string()))?;
                            report.closed.push(latest.id);
                        }
                    }
                }
                Action::Reembed { rewind } => {
                    if rewind {
                        db.transition_status(
                            file_id,
                            &[FileStatus::Embedding],
                            FileStatus::ParseSucceeded,
                            None,
                        )?;
                    }
                    let redrive = self
                        .orchestrator
                        .embed_files(file.repo_id, &[file_id], true, &Actor::system())
                        .await;
                    match redrive {
                        Ok(dispatch) if dispatch.accepted.contains(&file_id) => {
                            tracing::info!("[file {}] Recovery: embedding re-driven", file_id);
                            report.redriven.push(file_id);
                        }
                        Ok(_) => {
                            db.complete_task(latest.id, TaskStatus::Failed, Some("not re-driven"))?;
                            report.closed.push(latest.id);
                        }
                        Err(e) => {
                            tracing::warn!("[file {}] Recovery: re-embed rejected: {}", file_id, e);
                            db.complete_task(latest.id, TaskStatus::Failed, Some(&e.to_string()))?;
                            report.closed.push(latest.id);
                        }
                    }
                }
            }
        }

        if !report.redriven.is_empty() || !report.closed.is_empty() {
            tracing::info!(
                "Recovery: {} re-driven, {} closed, {} superseded",
                report.redriven.len(),
                report.closed.len(),
                report.superseded.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_files_are_never_redriven() {
        for stage in [TaskStage::Parse, TaskStage::Embed] {
            for status in [
                FileStatus::ParseFailed,
                FileStatus::EmbeddingFailed,
                FileStatus::EmbeddingSucceeded,
            ] {
                assert!(matches!(decide(stage, status), Action::Close(..)));
            }
        }
        assert_eq!(
            decide(TaskStage::Embed, FileStatus::EmbeddingSucceeded),
            Action::Close(TaskStatus::Done, "file already embedded")
        );
    }

    #[test]
    fn test_interrupted_work_is_redriven() {
        assert_eq!(decide(TaskStage::Parse, FileStatus::Parsing), Action::Reslice);
        assert_eq!(decide(TaskStage::Embed, FileStatus::Parsing), Action::Reslice);
        assert_eq!(
            decide(TaskStage::Embed, FileStatus::Embedding),
            Action::Reembed { rewind: true }
        );
        assert_eq!(
            decide(TaskStage::Embed, FileStatus::ParseSucceeded),
            Action::Reembed { rewind: false }
        );
        assert!(matches!(
            decide(TaskStage::Parse, FileStatus::ParseSucceeded),
            Action::Close(TaskStatus::Done, _)
        ));
    }
}
