//! Worker bookkeeping: per-file completion signals and in-flight tracking

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::types::TaskStage;

/// Per-file wake-ups for embed workers waiting on a parse
#[derive(Default)]
pub struct StageSignals {
    notifies: DashMap<i64, Arc<Notify>>,
    generations: DashMap<i64, u64>,
}

impl StageSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to wait on for a file's next status change
    pub fn subscribe(&self, file_id: i64) -> Arc<Notify> {
        self.notifies
            .entry(file_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake every waiter of a file
    pub fn notify(&self, file_id: i64) {
        if let Some(notify) = self.notifies.get(&file_id) {
            notify.notify_waiters();
        }
    }

    /// Register a new waiter for a file. Older waiters become stale and are woken so they
    /// can exit.
    pub fn claim(&self, file_id: i64) -> u64 {
        let generation = {
            let mut entry = self.generations.entry(file_id).or_insert(0);
            *entry += 1;
            *entry
        };
        self.notify(file_id);
        generation
    }

    pub fn is_current(&self, file_id: i64, generation: u64) -> bool {
        self.generations
            .get(&file_id)
            .map(|g| *g == generation)
            .unwrap_or(false)
    }

    /// Drop bookkeeping for a file once its waiter is done. The wake-up handle goes too
    /// when no newer waiter holds the file.
    pub fn release(&self, file_id: i64, generation: u64) {
        self.generations.remove_if(&file_id, |_, g| *g == generation);
        self.notifies
            .remove_if(&file_id, |_, _| !self.generations.contains_key(&file_id));
    }
}

/// Tracks which (file, stage) pairs have a live worker and how many background workers
/// are running
#[derive(Default)]
pub struct WorkTracker {
    active: DashMap<(i64, TaskStage), usize>,
    background: AtomicUsize,
    idle: Notify,
}

/// Marks a (file, stage) as owned by a live worker until dropped
pub struct StageGuard<'a> {
    tracker: &'a WorkTracker,
    key: (i64, TaskStage),
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        self.tracker.active.remove_if_mut(&self.key, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}

/// Releases one background slot when the worker ends, even by panic
struct BackgroundSlot {
    tracker: Arc<WorkTracker>,
}

impl Drop for BackgroundSlot {
    fn drop(&mut self) {
        if self.tracker.background.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

impl WorkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, file_id: i64, stage: TaskStage) -> StageGuard<'_> {
        *self.active.entry((file_id, stage)).or_insert(0) += 1;
        StageGuard {
            tracker: self,
            key: (file_id, stage),
        }
    }

    pub fn is_active(&self, file_id: i64, stage: TaskStage) -> bool {
        self.active.contains_key(&(file_id, stage))
    }

    /// Any stage of this file has a live worker
    pub fn file_busy(&self, file_id: i64) -> bool {
        self.is_active(file_id, TaskStage::Parse) || self.is_active(file_id, TaskStage::Embed)
    }

    /// Spawn a worker on its own task, counted until it finishes.
    ///
    /// The worker runs to completion whether or not anyone awaits the handle; dropping the
    /// handle only detaches it.
    pub fn spawn<F>(self: &Arc<Self>, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.background.fetch_add(1, Ordering::SeqCst);
        let slot = BackgroundSlot {
            tracker: Arc::clone(self),
        };
        tokio::spawn(async move {
            let _slot = slot;
            work.await
        })
    }

    pub fn background_count(&self) -> usize {
        self.background.load(Ordering::SeqCst)
    }

    /// Resolve once no background worker is running
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.background_count() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_newer_claim_supersedes() {
        let signals = StageSignals::new();
        let first = signals.claim(4);
        let second = signals.claim(4);
        assert!(!signals.is_current(4, first));
        assert!(signals.is_current(4, second));

        signals.release(4, first);
        assert!(signals.is_current(4, second));
        signals.release(4, second);
        assert!(!signals.is_current(4, second));
    }

    #[test]
    fn test_release_drops_idle_signal() {
        let signals = StageSignals::new();
        let first = signals.claim(6);
        let _ = signals.subscribe(6);
        let second = signals.claim(6);

        signals.release(6, first);
        assert_eq!(signals.notifies.len(), 1);

        signals.release(6, second);
        assert!(signals.notifies.is_empty());
        assert!(signals.generations.is_empty());
    }

    #[test]
    fn test_guard_tracks_stage() {
        let tracker = WorkTracker::new();
        {
            let _a = tracker.enter(1, TaskStage::Parse);
            let _b = tracker.enter(1, TaskStage::Parse);
            assert!(tracker.is_active(1, TaskStage::Parse));
            assert!(!tracker.is_active(1, TaskStage::Embed));
            assert!(tracker.file_busy(1));
        }
        assert!(!tracker.file_busy(1));
    }

    #[tokio::test]
    async fn test_wait_idle_after_background_work() {
        let tracker = Arc::new(WorkTracker::new());
        tracker.spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert_eq!(tracker.background_count(), 1);

        tokio::time::timeout(Duration::from_secs(2), tracker.wait_idle())
            .await
            .unwrap();
        assert_eq!(tracker.background_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_outlives_dropped_caller() {
        let tracker = Arc::new(WorkTracker::new());
        let caller = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let handle = tracker.spawn(async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    7
                });
                handle.await.unwrap()
            })
        };
        while tracker.background_count() == 0 {
            tokio::task::yield_now().await;
        }
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        assert_eq!(tracker.background_count(), 1);
        tokio::time::timeout(Duration::from_secs(2), tracker.wait_idle())
            .await
            .unwrap();
        assert_eq!(tracker.background_count(), 0);
    }

    #[tokio::test]
    async fn test_spawned_output_is_returned() {
        let tracker = Arc::new(WorkTracker::new());
        let handle = tracker.spawn(async { "done" });
        assert_eq!(handle.await.unwrap(), "done");
        assert_eq!(tracker.background_count(), 0);
    }

    #[tokio::test]
    async fn test_notify_wakes_subscriber() {
        let signals = StageSignals::new();
        let notify = signals.subscribe(9);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        signals.notify(9);
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .unwrap();
    }
}
