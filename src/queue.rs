//! Snapshot of the pending-work queue for one processing round.
//!
//! At the start of a round the queue is dumped to an anonymous temporary
//! file, one `<key> <identifier> <prefix> <origin> <sourceInfo>` line per
//! entry, and workers read from that file. Entries queued while the round
//! runs are therefore left for the next round.

use anyhow::{anyhow, Context, Result};
use sqlx::SqliteConnection;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};

use crate::index;
use crate::models::{ItemOutcome, QueueItem, QueueOrigin};

pub struct QueueSnapshot {
    reader: BufReader<File>,
    len: usize,
    remaining: usize,
}

impl QueueSnapshot {
    /// Dump the current queue and open it for reading.
    pub async fn take(conn: &mut SqliteConnection) -> Result<Self> {
        let file = tempfile::tempfile().context("Failed to create queue dump file")?;
        let mut writer = BufWriter::new(file);
        let len = index::dump_queue(conn, &mut writer).await?;
        writer.flush()?;
        let mut file = writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to finish queue dump: {}", e.error()))?;
        file.seek(SeekFrom::Start(0))?;

        Ok(Self {
            reader: BufReader::new(file),
            len,
            remaining: len,
        })
    }

    /// Number of entries in the snapshot.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entries not yet handed out.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Read up to `max` further entries.
    pub fn next_batch(&mut self, max: usize) -> Result<Vec<QueueItem>> {
        let mut batch = Vec::with_capacity(max.min(self.remaining));
        let mut line = String::new();
        while batch.len() < max {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                self.remaining = 0;
                break;
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }
            batch.push(parse_line(trimmed)?);
            self.remaining = self.remaining.saturating_sub(1);
        }
        Ok(batch)
    }
}

/// Parse one dump line. The source locator is the remainder of the line and
/// may contain spaces.
pub fn parse_line(line: &str) -> Result<QueueItem> {
    let mut parts = line.splitn(5, ' ');
    let (Some(key), Some(identifier), Some(prefix), Some(origin), Some(source_info)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(anyhow!("Malformed queue line: {:?}", line));
    };

    Ok(QueueItem {
        queue_key: key
            .parse()
            .with_context(|| format!("Bad queue key in line: {:?}", line))?,
        identifier: identifier.to_string(),
        prefix: prefix.to_string(),
        origin: QueueOrigin::from_tag(origin)
            .ok_or_else(|| anyhow!("Bad origin tag in line: {:?}", line))?,
        source_info: source_info.to_string(),
        outcome: ItemOutcome::Pending,
    })
}
