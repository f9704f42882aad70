//! Fetch workers: take batches from the round's queue snapshot, fetch and
//! validate each record into the content store, and hand the outcomes to
//! the committer.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::{ItemOutcome, QueueItem};
use crate::record::{ParsedRecord, RecordValidator};
use crate::round::Round;
use crate::source::RepositorySource;
use crate::store::ContentStore;

#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub attempted: u64,
    pub failed: u64,
    pub fetch_time: Duration,
    pub validation_time: Duration,
}

pub struct Worker {
    id: usize,
    round: Arc<Round>,
    source: Arc<dyn RepositorySource>,
    store: ContentStore,
    validator: Option<Arc<dyn RecordValidator>>,
}

impl Worker {
    pub fn new(
        id: usize,
        round: Arc<Round>,
        source: Arc<dyn RepositorySource>,
        store: ContentStore,
        validator: Option<Arc<dyn RecordValidator>>,
    ) -> Self {
        Self {
            id,
            round,
            source,
            store,
            validator,
        }
    }

    pub async fn run(self) -> WorkerStats {
        let mut stats = WorkerStats::default();
        let mut finished: Vec<QueueItem> = Vec::new();

        loop {
            let batch = match self.round.next_batch(std::mem::take(&mut finished)).await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker = self.id, error = %format!("{e:#}"), "cannot read queue snapshot");
                    self.round.abort(format!("{e:#}"));
                    break;
                }
            };

            for mut item in batch {
                if self.round.should_stop() {
                    break;
                }
                self.attempt(&mut item, &mut stats).await;
                finished.push(item);
            }

            if self.round.should_stop() {
                break;
            }
        }

        // Outcomes gathered before a stop are still offered; the committer
        // discards them if it has already closed.
        self.round.hand_off(finished).await;
        self.round.worker_exited();

        tracing::debug!(
            worker = self.id,
            attempted = stats.attempted,
            failed = stats.failed,
            "worker finished"
        );
        stats
    }

    async fn attempt(&self, item: &mut QueueItem, stats: &mut WorkerStats) {
        stats.attempted += 1;
        item.outcome = match self.fetch(item, stats).await {
            Ok(record) => ItemOutcome::Succeeded(record),
            Err(e) => {
                stats.failed += 1;
                let reason = format!("{e:#}");
                tracing::info!(
                    worker = self.id,
                    identifier = %item.identifier,
                    prefix = %item.prefix,
                    origin = %item.origin,
                    reason = %reason,
                    "record fetch failed"
                );
                ItemOutcome::Failed {
                    reason,
                    date: Utc::now(),
                }
            }
        };
    }

    async fn fetch(&self, item: &QueueItem, stats: &mut WorkerStats) -> Result<ParsedRecord> {
        let started = Instant::now();
        let mut writer = self.store.allocate().await?;
        let written = self
            .source
            .write_record_xml(&item.identifier, &item.prefix, &item.source_info, &mut writer)
            .await;
        stats.fetch_time += started.elapsed();
        if let Err(e) = written {
            writer.discard();
            return Err(e);
        }

        let path = writer.finish()?;
        let file = self.store.file(&path);

        let started = Instant::now();
        let checked = self.check(item, &path, &file);
        stats.validation_time += started.elapsed();

        if checked.is_err() {
            if let Err(e) = self.store.delete(&path) {
                tracing::warn!(path = %path, error = %e, "failed to delete rejected record");
            }
        }
        checked
    }

    fn check(&self, item: &QueueItem, path: &str, file: &std::path::Path) -> Result<ParsedRecord> {
        if let Some(validator) = &self.validator {
            let xml = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            validator
                .validate(&item.prefix, &xml)
                .context("Record failed validation")?;
        }
        ParsedRecord::parse(&item.identifier, &item.prefix, path, file)
    }
}
