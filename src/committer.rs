//! Serialized application of worker results to the index.
//!
//! Workers push finished [`QueueItem`]s into a bounded [`CommitQueue`]; a
//! single [`Committer`] drains it and applies each group of items in one
//! transaction. The queue's capacity is what keeps fetches from running
//! ahead of the database.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::config::UpdaterConfig;
use crate::index;
use crate::models::{ItemOutcome, QueueItem};
use crate::round::Round;

/// Bounded handoff queue between workers and the committer.
pub struct CommitQueue {
    items: Mutex<VecDeque<QueueItem>>,
    /// Last known length, readable without taking the lock.
    size_hint: AtomicUsize,
    capacity: usize,
    poll: Duration,
    stopped: AtomicBool,
    space: Notify,
    arrivals: Notify,
}

impl CommitQueue {
    pub fn new(capacity: usize, poll: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            size_hint: AtomicUsize::new(0),
            capacity,
            poll,
            stopped: AtomicBool::new(false),
            space: Notify::new(),
            arrivals: Notify::new(),
        }
    }

    pub fn len_hint(&self) -> usize {
        self.size_hint.load(Ordering::Acquire)
    }

    /// Offer `items`, waiting while the queue lacks room for all of them.
    ///
    /// Returns the items back if the committer has stopped accepting work.
    pub async fn handoff(&self, items: Vec<QueueItem>) -> std::result::Result<(), Vec<QueueItem>> {
        if items.is_empty() {
            return Ok(());
        }
        let n = items.len();

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(items);
            }

            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if self.size_hint.load(Ordering::Acquire) + n <= self.capacity {
                let Ok(mut queue) = self.items.lock() else {
                    return Err(items);
                };
                if self.stopped.load(Ordering::Acquire) {
                    return Err(items);
                }
                if queue.len() + n <= self.capacity {
                    queue.extend(items);
                    self.size_hint.store(queue.len(), Ordering::Release);
                    drop(queue);
                    self.arrivals.notify_one();
                    return Ok(());
                }
            }

            let _ = tokio::time::timeout(self.poll, space).await;
        }
    }

    /// Remove up to `max` items, oldest first.
    pub fn take(&self, max: usize) -> Vec<QueueItem> {
        let taken: Vec<QueueItem> = match self.items.lock() {
            Ok(mut queue) => {
                let n = max.min(queue.len());
                let taken = queue.drain(..n).collect();
                self.size_hint.store(queue.len(), Ordering::Release);
                taken
            }
            Err(_) => Vec::new(),
        };
        if !taken.is_empty() {
            self.space.notify_waiters();
        }
        taken
    }

    /// Wait up to `timeout` for items to arrive or for a wake-up.
    pub async fn wait_for_items(&self, timeout: Duration) {
        let arrived = self.arrivals.notified();
        tokio::pin!(arrived);
        arrived.as_mut().enable();
        if self.len_hint() > 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, arrived).await;
    }

    /// Wake a committer waiting in [`CommitQueue::wait_for_items`].
    pub fn wake(&self) {
        self.arrivals.notify_one();
    }

    /// Stop accepting items and return whatever is still queued.
    pub fn close(&self) -> Vec<QueueItem> {
        self.stopped.store(true, Ordering::Release);
        let leftovers = match self.items.lock() {
            Ok(mut queue) => {
                let all = queue.drain(..).collect();
                self.size_hint.store(0, Ordering::Release);
                all
            }
            Err(_) => Vec::new(),
        };
        self.space.notify_waiters();
        leftovers
    }
}

#[derive(Debug, Default, Clone)]
pub struct CommitStats {
    pub transactions: u64,
    pub processed: u64,
    pub commit_time: Duration,
}

pub struct Committer {
    pool: SqlitePool,
    round: Arc<Round>,
    queue: Arc<CommitQueue>,
    format_keys: HashMap<String, i64>,
    max_per_transaction: usize,
    date_margin: chrono::Duration,
    poll: Duration,
}

impl Committer {
    /// Build a committer, loading the current format keys.
    pub async fn new(
        pool: SqlitePool,
        round: Arc<Round>,
        queue: Arc<CommitQueue>,
        config: &UpdaterConfig,
    ) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        let format_keys = index::format_key_map(&mut conn).await?;
        drop(conn);

        Ok(Self {
            pool,
            round,
            queue,
            format_keys,
            max_per_transaction: config.max_records_per_transaction.max(1),
            date_margin: chrono::Duration::milliseconds(config.commit_date_margin_ms),
            poll: config.handoff_poll(),
        })
    }

    pub async fn run(self) -> CommitStats {
        let mut stats = CommitStats::default();

        // Commit while workers are still producing
        while self.round.workers_alive() && !self.round.should_stop() {
            let items = self.queue.take(self.max_per_transaction);
            if items.is_empty() {
                self.queue.wait_for_items(self.poll).await;
                continue;
            }
            self.commit_or_abort(items, &mut stats).await;
        }

        // Drain whatever the workers left behind
        while !self.round.should_stop() {
            let items = self.queue.take(self.max_per_transaction);
            if items.is_empty() {
                break;
            }
            self.commit_or_abort(items, &mut stats).await;
        }

        let leftovers = self.queue.close();
        if !leftovers.is_empty() {
            tracing::debug!(items = leftovers.len(), "discarding uncommitted items");
            self.round.discard(&leftovers);
        }

        stats
    }

    async fn commit_or_abort(&self, items: Vec<QueueItem>, stats: &mut CommitStats) {
        let started = Instant::now();
        match self.commit(&items).await {
            Ok(()) => {
                stats.transactions += 1;
                stats.processed += items.len() as u64;
                stats.commit_time += started.elapsed();
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), items = items.len(), "commit failed; aborting round");
                self.round.discard(&items);
                self.round.abort(format!("{e:#}"));
            }
        }
    }

    async fn commit(&self, items: &[QueueItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let stamp = match self.apply(&mut tx, items).await {
            Ok(stamp) => stamp,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        let now = Utc::now();
        if now > stamp {
            tracing::warn!(
                overrun_ms = (now - stamp).num_milliseconds(),
                "commit finished after the stamped record date; increase updater.commit_date_margin_ms"
            );
        }
        Ok(())
    }

    /// Apply every item and stamp the new records. Returns the stamp.
    async fn apply(&self, conn: &mut SqliteConnection, items: &[QueueItem]) -> Result<DateTime<Utc>> {
        for item in items {
            let prior_failures = index::remove_from_queue(&mut *conn, item.queue_key)
                .await?
                .unwrap_or(0);

            match &item.outcome {
                ItemOutcome::Succeeded(record) => {
                    let missing = index::missing_sets(&mut *conn, &record.set_specs).await?;
                    if missing.is_empty() {
                        index::put_record(&mut *conn, record, &self.format_keys).await?;
                        index::remove_failure(&mut *conn, &item.identifier, &item.prefix).await?;
                    } else {
                        index::add_prunable(&mut *conn, &record.path).await?;
                        let reason = format!(
                            "Record refers to set(s) the repository does not list: {}",
                            missing.join(", ")
                        );
                        record_failure(&mut *conn, item, prior_failures, &reason, Utc::now()).await?;
                    }
                }
                ItemOutcome::Failed { reason, date } => {
                    record_failure(&mut *conn, item, prior_failures, reason, *date).await?;
                }
                ItemOutcome::Pending => {
                    bail!("Queue item {} reached the committer unattempted", item.queue_key)
                }
            }
        }

        let stamp = Utc::now() + self.date_margin;
        index::set_uncommitted_record_dates(&mut *conn, stamp.timestamp_millis()).await?;
        Ok(stamp)
    }
}

async fn record_failure(
    conn: &mut SqliteConnection,
    item: &QueueItem,
    prior_failures: i64,
    reason: &str,
    date: DateTime<Utc>,
) -> Result<()> {
    match index::fail_count(&mut *conn, &item.identifier, &item.prefix).await? {
        None => {
            index::add_failure(
                &mut *conn,
                &item.identifier,
                &item.prefix,
                &item.source_info,
                prior_failures + 1,
                date,
                reason,
            )
            .await
        }
        Some(count) => {
            index::update_failure(
                &mut *conn,
                &item.identifier,
                &item.prefix,
                &item.source_info,
                count.max(prior_failures) + 1,
                date,
                reason,
            )
            .await
        }
    }
}
