//! Core data types shared by the harvester, the index and the session layer.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::record::ParsedRecord;

/// Second-granularity UTC datestamp used in record headers and list output.
pub const DATESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format an epoch-millisecond timestamp as a record datestamp.
pub fn format_datestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format(DATESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// A metadata schema as reported by the remote repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFormat {
    pub prefix: String,
    pub namespace_uri: String,
    pub schema_location: String,
}

/// A metadata format as stored in the index.
#[derive(Debug, Clone)]
pub struct CachedFormat {
    pub key: i64,
    pub prefix: String,
    pub namespace_uri: String,
    pub schema_location: String,
    /// Remote watermark in epoch milliseconds; 0 when never polled.
    pub last_poll_date: i64,
}

/// A set spec plus its descriptor XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInfo {
    pub spec: String,
    pub xml: String,
}

/// One entry of the remote repository's change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub identifier: String,
    pub prefix: String,
    pub source_info: String,
}

/// Where a queued unit of work came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrigin {
    /// Discovered as changed during polling.
    Remote,
    /// A previous failure being retried.
    Failed,
}

impl QueueOrigin {
    pub fn tag(self) -> char {
        match self {
            QueueOrigin::Remote => 'R',
            QueueOrigin::Failed => 'F',
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "R" => Some(QueueOrigin::Remote),
            "F" => Some(QueueOrigin::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for QueueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Result of a worker's attempt at a queue item.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Pending,
    Succeeded(ParsedRecord),
    Failed {
        reason: String,
        date: DateTime<Utc>,
    },
}

/// A pending unit of work travelling from the queue dump, through a worker,
/// to the committer.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub queue_key: i64,
    pub identifier: String,
    pub prefix: String,
    pub origin: QueueOrigin,
    pub source_info: String,
    pub outcome: ItemOutcome,
}

impl QueueItem {
    /// Content path written for this item, if the attempt succeeded.
    pub fn written_path(&self) -> Option<&str> {
        match &self.outcome {
            ItemOutcome::Succeeded(record) => Some(&record.path),
            _ => None,
        }
    }
}

/// Path and presentation datestamp of a cached record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub path: String,
    pub datestamp: String,
}

/// Retry bookkeeping for one (item, format) pair.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub identifier: String,
    pub prefix: String,
    pub source_info: String,
    pub fail_count: i64,
    pub first_fail_date: String,
    pub last_fail_date: String,
    pub last_fail_reason: String,
}

/// A superseded content path awaiting deletion.
#[derive(Debug, Clone)]
pub struct Prunable {
    pub key: i64,
    pub path: String,
}
