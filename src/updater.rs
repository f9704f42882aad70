//! The harvesting scheduler.
//!
//! One cycle is: drain whatever is left in the work queue, poll the remote
//! source for changes (which refills the queue), drain again, then delete
//! superseded content. Between cycles the updater sleeps for
//! `updater.poll_seconds`.
//!
//! # Shutdown
//!
//! A *graceful* shutdown is honoured only while sleeping: a running cycle is
//! allowed to finish. An *immediate* shutdown is observed by workers, the
//! committer and the polling loop within one polling interval. Whatever
//! transaction is open at that point rolls back, and content written for it
//! is removed.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::committer::{CommitQueue, CommitStats, Committer};
use crate::config::UpdaterConfig;
use crate::index;
use crate::models::SetInfo;
use crate::queue::QueueSnapshot;
use crate::record::{RecordValidator, WellFormedValidator};
use crate::round::{worker_count, Round};
use crate::setspec;
use crate::source::RepositorySource;
use crate::store::ContentStore;
use crate::worker::{Worker, WorkerStats};

/// Prunables are deleted this many at a time.
const PRUNE_BATCH_SIZE: i64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    Idle,
    DrainingOldQueue,
    PollingRemote,
    DrainingNewQueue,
    Pruning,
    Sleeping,
    Stopped,
}

impl fmt::Display for UpdaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdaterState::Idle => "idle",
            UpdaterState::DrainingOldQueue => "draining-old-queue",
            UpdaterState::PollingRemote => "polling-remote",
            UpdaterState::DrainingNewQueue => "draining-new-queue",
            UpdaterState::Pruning => "pruning",
            UpdaterState::Sleeping => "sleeping",
            UpdaterState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub rounds: usize,
    /// Queue items whose outcome was committed.
    pub processed: u64,
    /// Items whose fetch, validation or parse failed.
    pub failed: u64,
    /// Failures moved back onto the queue.
    pub retried: u64,
    /// Remotely changed records queued by polling.
    pub queued: u64,
    /// Whether the remote source was actually polled.
    pub polled: bool,
    pub pruned: usize,
    /// The cycle ended early because of an immediate shutdown.
    pub interrupted: bool,
}

pub struct Updater {
    pool: SqlitePool,
    store: ContentStore,
    source: Arc<dyn RepositorySource>,
    validator: Option<Arc<dyn RecordValidator>>,
    config: UpdaterConfig,
    graceful: CancellationToken,
    immediate: CancellationToken,
    state: Arc<Mutex<UpdaterState>>,
}

impl Updater {
    pub fn new(
        pool: SqlitePool,
        store: ContentStore,
        source: Arc<dyn RepositorySource>,
        config: UpdaterConfig,
    ) -> Self {
        let validator: Option<Arc<dyn RecordValidator>> = if config.validate_records {
            Some(Arc::new(WellFormedValidator))
        } else {
            None
        };
        Self {
            pool,
            store,
            source,
            validator,
            config,
            graceful: CancellationToken::new(),
            immediate: CancellationToken::new(),
            state: Arc::new(Mutex::new(UpdaterState::Idle)),
        }
    }

    /// Replace the record validator. `None` accepts every well-formed header.
    pub fn with_validator(mut self, validator: Option<Arc<dyn RecordValidator>>) -> Self {
        self.validator = validator;
        self
    }

    pub fn state(&self) -> UpdaterState {
        current_state(&self.state)
    }

    fn set_state(&self, state: UpdaterState) {
        if let Ok(mut current) = self.state.lock() {
            if *current != state {
                tracing::debug!(from = %*current, to = %state, "updater state");
                *current = state;
            }
        }
    }

    /// Run the updater on its own task until shut down.
    pub fn spawn(self) -> UpdaterHandle {
        let graceful = self.graceful.clone();
        let immediate = self.immediate.clone();
        let state = self.state.clone();
        let task = tokio::spawn(async move { self.run().await });
        UpdaterHandle {
            graceful,
            immediate,
            state,
            task,
        }
    }

    /// Repeat cycles, sleeping in between, until a shutdown is requested.
    pub async fn run(&self) {
        loop {
            match self.run_cycle().await {
                Ok(report) => log_report(&report),
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "update cycle failed; retrying next cycle")
                }
            }

            if self.immediate.is_cancelled() {
                break;
            }

            self.set_state(UpdaterState::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = self.graceful.cancelled() => break,
                _ = self.immediate.cancelled() => break,
            }
        }
        self.set_state(UpdaterState::Stopped);
        tracing::info!("updater stopped");
    }

    /// One full cycle. Polling errors are logged and do not fail the cycle;
    /// an aborted processing round does.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.set_state(UpdaterState::DrainingOldQueue);
        if self.drain_queue(&mut report).await?.is_break() {
            return Ok(interrupted(report));
        }

        self.set_state(UpdaterState::PollingRemote);
        match self.poll_and_update(&mut report).await {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => return Ok(interrupted(report)),
            Err(e) => {
                tracing::warn!(
                    source = self.source.name(),
                    error = %format!("{e:#}"),
                    "polling failed; will retry next cycle"
                );
            }
        }

        self.set_state(UpdaterState::DrainingNewQueue);
        if self.drain_queue(&mut report).await?.is_break() {
            return Ok(interrupted(report));
        }

        self.set_state(UpdaterState::Pruning);
        report.pruned = self.prune().await?;

        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Draining
    // ═══════════════════════════════════════════════════════════════════

    async fn drain_queue(&self, report: &mut CycleReport) -> Result<ControlFlow<()>> {
        loop {
            if self.immediate.is_cancelled() {
                return Ok(ControlFlow::Break(()));
            }

            let mut conn = self.pool.acquire().await?;
            let snapshot = QueueSnapshot::take(&mut conn).await?;
            drop(conn);

            if snapshot.is_empty() {
                return Ok(ControlFlow::Continue(()));
            }
            self.run_round(snapshot, report).await?;
        }
    }

    /// Process one queue snapshot with a fresh worker pool and committer.
    async fn run_round(&self, snapshot: QueueSnapshot, report: &mut CycleReport) -> Result<()> {
        let started = Instant::now();
        let size = snapshot.len();
        let workers = worker_count(size, self.config.max_workers, self.config.max_work_batch_size);
        tracing::info!(items = size, workers, "starting processing round");

        let commit_queue = Arc::new(CommitQueue::new(
            self.config.max_commit_queue_size,
            self.config.handoff_poll(),
        ));
        let round = Arc::new(Round::new(
            snapshot,
            commit_queue.clone(),
            self.store.clone(),
            self.config.max_work_batch_size,
            workers,
            self.immediate.clone(),
        ));

        let committer = Committer::new(self.pool.clone(), round.clone(), commit_queue.clone(), &self.config).await?;
        let committer = tokio::spawn(committer.run());

        let handles: Vec<JoinHandle<WorkerStats>> = (0..workers)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    round.clone(),
                    self.source.clone(),
                    self.store.clone(),
                    self.validator.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let workers_done = async {
            let mut totals = WorkerStats::default();
            for handle in handles {
                match handle.await {
                    Ok(stats) => {
                        totals.attempted += stats.attempted;
                        totals.failed += stats.failed;
                        totals.fetch_time += stats.fetch_time;
                        totals.validation_time += stats.validation_time;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "worker task failed");
                        round.abort(format!("worker task failed: {e}"));
                        round.worker_exited();
                    }
                }
            }
            totals
        };
        let committer_done = async {
            match committer.await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::error!(error = %e, "committer task failed");
                    round.abort(format!("committer task failed: {e}"));
                    round.discard(&commit_queue.close());
                    CommitStats::default()
                }
            }
        };
        let (worker_stats, commit_stats) = tokio::join!(workers_done, committer_done);

        report.rounds += 1;
        report.processed += commit_stats.processed;
        report.failed += worker_stats.failed;

        tracing::info!(
            items = size,
            attempted = worker_stats.attempted,
            failed = worker_stats.failed,
            committed = commit_stats.processed,
            transactions = commit_stats.transactions,
            fetch_ms = worker_stats.fetch_time.as_millis() as u64,
            validation_ms = worker_stats.validation_time.as_millis() as u64,
            commit_ms = commit_stats.commit_time.as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processing round finished"
        );

        if round.is_aborted() {
            bail!(
                "Processing round aborted: {}",
                round.abort_reason().unwrap_or_else(|| "unknown reason".to_string())
            );
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Polling
    // ═══════════════════════════════════════════════════════════════════

    /// Requeue retryable failures and, if the remote repository changed,
    /// refresh identify, formats and sets and queue changed records. All of
    /// it happens in one transaction.
    async fn poll_and_update(&self, report: &mut CycleReport) -> Result<ControlFlow<()>> {
        let mut tx = self.pool.begin().await?;
        let mut first_written: Option<String> = None;

        let outcome = match self.poll_within(&mut tx, &mut first_written, report).await {
            Ok(ControlFlow::Continue(())) => match tx.commit().await {
                Ok(()) => return Ok(ControlFlow::Continue(())),
                Err(e) => Err(anyhow::Error::from(e).context("Failed to commit polling transaction")),
            },
            stopped_or_failed => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                stopped_or_failed
            }
        };

        // Nothing written during this poll was committed
        report.retried = 0;
        report.queued = 0;
        report.polled = false;
        if let Some(path) = first_written {
            self.store.cancel(&path).await;
        }
        outcome
    }

    async fn poll_within(
        &self,
        conn: &mut SqliteConnection,
        first_written: &mut Option<String>,
        report: &mut CycleReport,
    ) -> Result<ControlFlow<()>> {
        report.retried = index::queue_failed_records(&mut *conn, self.config.max_failed_retries).await?;
        if report.retried > 0 {
            tracing::info!(count = report.retried, "re-queued failed records");
        }

        if !index::polling_enabled(&mut *conn).await? {
            tracing::debug!("polling disabled");
            return Ok(ControlFlow::Continue(()));
        }

        let latest = self.source.latest_change().await?;
        let earliest = index::earliest_poll_date(&mut *conn).await?;
        if latest.timestamp_millis() <= earliest {
            tracing::debug!(latest = %latest, "remote repository unchanged");
            return Ok(ControlFlow::Continue(()));
        }
        report.polled = true;
        tracing::info!(source = self.source.name(), latest = %latest, "polling remote repository");

        if self.immediate.is_cancelled() {
            return Ok(ControlFlow::Break(()));
        }
        self.update_identify(&mut *conn, first_written).await?;
        self.update_formats(&mut *conn).await?;
        self.update_sets(&mut *conn, first_written).await?;

        if self.immediate.is_cancelled() {
            return Ok(ControlFlow::Break(()));
        }
        self.queue_updated_records(&mut *conn, latest, report).await
    }

    async fn update_identify(
        &self,
        conn: &mut SqliteConnection,
        first_written: &mut Option<String>,
    ) -> Result<()> {
        let mut writer = self.store.allocate().await?;
        first_written.get_or_insert_with(|| writer.path().to_string());
        if let Err(e) = self.source.write_identify_xml(&mut writer).await {
            writer.discard();
            return Err(e);
        }
        let path = writer.finish()?;
        index::set_identify_path(&mut *conn, &path).await
    }

    async fn update_formats(&self, conn: &mut SqliteConnection) -> Result<()> {
        let remote = self.source.list_formats().await?;
        for format in &remote {
            index::put_format(&mut *conn, format).await?;
        }

        let listed: HashSet<&str> = remote.iter().map(|f| f.prefix.as_str()).collect();
        for cached in index::formats(&mut *conn, None).await? {
            if !listed.contains(cached.prefix.as_str()) {
                tracing::info!(prefix = %cached.prefix, "removing format no longer offered");
                index::delete_format(&mut *conn, &cached.prefix).await?;
            }
        }
        Ok(())
    }

    async fn update_sets(
        &self,
        conn: &mut SqliteConnection,
        first_written: &mut Option<String>,
    ) -> Result<()> {
        let mut sets: BTreeMap<String, SetInfo> = BTreeMap::new();
        for set in self.source.list_sets().await? {
            if !setspec::is_valid(&set.spec) {
                tracing::warn!(spec = %set.spec, "skipping set with invalid spec");
                continue;
            }
            sets.insert(set.spec.clone(), set);
        }

        let listed: Vec<String> = sets.keys().cloned().collect();
        for spec in &listed {
            for ancestor in setspec::all_sets_for(spec) {
                if !sets.contains_key(&ancestor) {
                    tracing::warn!(spec = %ancestor, "Adding missing set");
                    let xml = setspec::default_descriptor(&ancestor);
                    sets.insert(ancestor.clone(), SetInfo { spec: ancestor, xml });
                }
            }
        }

        for set in sets.values() {
            if let Some(path) = index::set_info(&mut *conn, &set.spec).await? {
                let cached = std::fs::read_to_string(self.store.file(&path)).unwrap_or_default();
                if cached == set.xml {
                    continue;
                }
            }
            let path = self.store.write(set).await?;
            first_written.get_or_insert_with(|| path.clone());
            index::put_set(&mut *conn, &set.spec, &path).await?;
        }

        for spec in index::set_specs(&mut *conn).await? {
            if !sets.contains_key(&spec) {
                tracing::info!(spec = %spec, "removing set no longer listed");
                index::delete_set(&mut *conn, &spec).await?;
            }
        }
        Ok(())
    }

    async fn queue_updated_records(
        &self,
        conn: &mut SqliteConnection,
        until: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<ControlFlow<()>> {
        let until_ms = until.timestamp_millis();

        for format in index::formats(&mut *conn, None).await? {
            let from = if format.last_poll_date > 0 {
                DateTime::<Utc>::from_timestamp_millis(format.last_poll_date)
            } else {
                None
            };

            let mut queued: u64 = 0;
            let mut records = self.source.list_changed_records(from, until, &format.prefix).await?;
            while let Some(record) = records.try_next().await? {
                if self.immediate.is_cancelled() {
                    return Ok(ControlFlow::Break(()));
                }
                index::queue_remote_record(&mut *conn, &record).await?;
                queued += 1;
            }
            drop(records);

            index::set_last_poll_date(&mut *conn, &format.prefix, until_ms).await?;
            if queued > 0 {
                tracing::info!(prefix = %format.prefix, count = queued, "queued changed records");
            }
            report.queued += queued;
        }
        Ok(ControlFlow::Continue(()))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Pruning
    // ═══════════════════════════════════════════════════════════════════

    /// Delete every prunable file and its row, then sweep empty directories.
    /// Returns the number of files removed.
    pub async fn prune(&self) -> Result<usize> {
        prune(&self.pool, &self.store, &self.immediate).await
    }
}

/// Delete prunable files in small batches. Rows whose file could not be
/// removed are kept for the next sweep.
pub async fn prune(pool: &SqlitePool, store: &ContentStore, stop: &CancellationToken) -> Result<usize> {
    let mut conn = pool.acquire().await?;
    let mut after = 0;
    let mut removed = 0;

    loop {
        if stop.is_cancelled() {
            break;
        }
        let batch = index::prunables_after(&mut conn, after, PRUNE_BATCH_SIZE).await?;
        let Some(last) = batch.last() else {
            break;
        };
        after = last.key;

        let mut done = Vec::with_capacity(batch.len());
        for prunable in &batch {
            match store.delete(&prunable.path) {
                Ok(existed) => {
                    if existed {
                        removed += 1;
                    }
                    done.push(prunable.key);
                }
                Err(e) => tracing::warn!(path = %prunable.path, error = %e, "failed to prune content file"),
            }
        }
        index::delete_prunables(&mut conn, &done).await?;
    }
    drop(conn);

    let dirs = store.prune_empty_dirs().await;
    if removed > 0 || dirs > 0 {
        tracing::info!(files = removed, dirs, "pruned content store");
    }
    Ok(removed)
}

fn interrupted(mut report: CycleReport) -> CycleReport {
    report.interrupted = true;
    report
}

fn current_state(state: &Mutex<UpdaterState>) -> UpdaterState {
    state.lock().map(|s| *s).unwrap_or(UpdaterState::Stopped)
}

fn log_report(report: &CycleReport) {
    tracing::info!(
        rounds = report.rounds,
        processed = report.processed,
        failed = report.failed,
        retried = report.retried,
        queued = report.queued,
        polled = report.polled,
        pruned = report.pruned,
        "update cycle finished"
    );
}

/// Control handle for a spawned [`Updater`].
pub struct UpdaterHandle {
    graceful: CancellationToken,
    immediate: CancellationToken,
    state: Arc<Mutex<UpdaterState>>,
    task: JoinHandle<()>,
}

impl UpdaterHandle {
    /// Request a shutdown. An immediate one also implies a graceful one.
    pub fn shutdown(&self, immediate: bool) {
        if immediate {
            self.immediate.cancel();
        }
        self.graceful.cancel();
    }

    pub fn state(&self) -> UpdaterState {
        current_state(&self.state)
    }

    /// Wait for the updater task to finish.
    pub async fn join(self) -> Result<()> {
        self.task.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(UpdaterState::DrainingOldQueue.to_string(), "draining-old-queue");
        assert_eq!(UpdaterState::PollingRemote.to_string(), "polling-remote");
        assert_eq!(UpdaterState::Sleeping.to_string(), "sleeping");
    }

    #[test]
    fn test_interrupted_keeps_counts() {
        let report = interrupted(CycleReport {
            rounds: 2,
            processed: 7,
            ..Default::default()
        });
        assert!(report.interrupted);
        assert_eq!(report.processed, 7);
    }
}
