//! Pipeline processing: orchestration, per-file workers, retry and crash recovery

mod orchestrator;
mod recovery;
mod retry;
mod worker;

pub use orchestrator::PipelineOrchestrator;
pub use recovery::{RecoveryReport, RecoverySweeper};
pub use retry::{is_transient, RetryPolicy};
pub use worker::{StageGuard, StageSignals, WorkTracker};
