//! State shared by the workers and the committer of one processing round.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::committer::CommitQueue;
use crate::models::QueueItem;
use crate::queue::QueueSnapshot;
use crate::store::ContentStore;

/// Number of workers for a round: enough to give each at most one full
/// batch, capped at `max_workers`, and never fewer than one.
pub fn worker_count(queue_size: usize, max_workers: usize, max_batch: usize) -> usize {
    let needed = queue_size.div_ceil(max_batch.max(1));
    needed.min(max_workers).max(1)
}

pub struct Round {
    snapshot: Mutex<QueueSnapshot>,
    commit_queue: Arc<CommitQueue>,
    store: ContentStore,
    max_batch: usize,
    workers: usize,
    live_workers: AtomicUsize,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl Round {
    pub fn new(
        snapshot: QueueSnapshot,
        commit_queue: Arc<CommitQueue>,
        store: ContentStore,
        max_batch: usize,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            commit_queue,
            store,
            max_batch: max_batch.max(1),
            workers: workers.max(1),
            live_workers: AtomicUsize::new(workers.max(1)),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            shutdown,
        }
    }

    /// True once the round was aborted or an immediate shutdown was requested.
    pub fn should_stop(&self) -> bool {
        self.aborted.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Stop the round. Only the first reason is kept.
    pub fn abort(&self, reason: String) {
        if let Ok(mut slot) = self.abort_reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.aborted.store(true, Ordering::Release);
        self.commit_queue.wake();
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().ok().and_then(|r| r.clone())
    }

    /// Hand `finished` to the committer, then take the next batch of work.
    /// Returns `None` when the snapshot is exhausted or the round is stopping.
    pub async fn next_batch(&self, finished: Vec<QueueItem>) -> Result<Option<Vec<QueueItem>>> {
        self.hand_off(finished).await;

        if self.should_stop() {
            return Ok(None);
        }

        let batch = {
            let mut snapshot = self
                .snapshot
                .lock()
                .map_err(|_| anyhow::anyhow!("queue snapshot lock poisoned"))?;
            let size = self.batch_size(snapshot.remaining());
            snapshot.next_batch(size)?
        };

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    /// Offer finished items to the committer; if it no longer accepts them,
    /// their content files are removed.
    pub async fn hand_off(&self, finished: Vec<QueueItem>) {
        if finished.is_empty() {
            return;
        }
        if let Err(rejected) = self.commit_queue.handoff(finished).await {
            tracing::debug!(items = rejected.len(), "committer stopped; discarding finished items");
            self.discard(&rejected);
        }
    }

    /// Batch size shrinks as the snapshot drains so the tail is shared.
    fn batch_size(&self, remaining: usize) -> usize {
        remaining.div_ceil(self.workers).clamp(1, self.max_batch)
    }

    pub fn worker_exited(&self) {
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
        self.commit_queue.wake();
    }

    pub fn workers_alive(&self) -> bool {
        self.live_workers.load(Ordering::Acquire) > 0
    }

    /// Delete the content written for items that will not be committed.
    pub fn discard(&self, items: &[QueueItem]) {
        for path in items.iter().filter_map(QueueItem::written_path) {
            if let Err(e) = self.store.delete(path) {
                tracing::warn!(path, error = %e, "failed to delete uncommitted content");
            }
        }
    }
}
