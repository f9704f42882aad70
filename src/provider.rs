//! Lazy result sources for paginated list responses.
//!
//! A [`ListProvider`] describes one list query. A session opens it once and
//! pulls entries from the returned cursor as parts are produced; when the
//! very first part would be empty, the provider explains why.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::RecordCache;
use crate::error::ProtocolError;
use crate::index::PathCursor;

#[async_trait]
pub trait ListProvider: Send + Sync {
    /// Verb whose element wraps every part, e.g. `ListRecords`.
    fn verb(&self) -> &'static str;

    /// Entries per response part.
    fn page_size(&self) -> usize;

    /// Whether entries are rendered as headers only.
    fn headers_only(&self) -> bool {
        false
    }

    async fn open(&self) -> Result<PathCursor>;

    /// The condition to report when the query matched nothing at all.
    async fn diagnose_empty(&self) -> Result<ProtocolError>;
}

/// Selection criteria shared by record and identifier lists.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub prefix: String,
    pub set: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// `ListRecords` or, with `headers_only`, `ListIdentifiers`.
pub struct RecordListProvider {
    cache: RecordCache,
    query: RecordQuery,
    page_size: usize,
    headers_only: bool,
}

impl RecordListProvider {
    pub fn records(cache: RecordCache, query: RecordQuery, page_size: usize) -> Self {
        Self {
            cache,
            query,
            page_size,
            headers_only: false,
        }
    }

    pub fn identifiers(cache: RecordCache, query: RecordQuery, page_size: usize) -> Self {
        Self {
            cache,
            query,
            page_size,
            headers_only: true,
        }
    }
}

#[async_trait]
impl ListProvider for RecordListProvider {
    fn verb(&self) -> &'static str {
        if self.headers_only {
            "ListIdentifiers"
        } else {
            "ListRecords"
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn headers_only(&self) -> bool {
        self.headers_only
    }

    async fn open(&self) -> Result<PathCursor> {
        self.cache.record_paths(&self.query, self.page_size).await
    }

    async fn diagnose_empty(&self) -> Result<ProtocolError> {
        if !self.cache.format_exists(&self.query.prefix).await? {
            return Ok(ProtocolError::no_such_format());
        }
        if self.query.set.is_some() && !self.cache.has_sets().await? {
            return Ok(ProtocolError::no_set_hierarchy());
        }
        Ok(ProtocolError::no_records_match())
    }
}

/// `ListSets`.
pub struct SetListProvider {
    cache: RecordCache,
    page_size: usize,
}

impl SetListProvider {
    pub fn new(cache: RecordCache, page_size: usize) -> Self {
        Self { cache, page_size }
    }
}

#[async_trait]
impl ListProvider for SetListProvider {
    fn verb(&self) -> &'static str {
        "ListSets"
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn open(&self) -> Result<PathCursor> {
        self.cache.set_paths(self.page_size).await
    }

    async fn diagnose_empty(&self) -> Result<ProtocolError> {
        Ok(ProtocolError::no_set_hierarchy())
    }
}
