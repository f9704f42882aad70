//! Read access to the cache: the index plus the content store behind it.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::index::{self, PathCursor};
use crate::models::CachedFormat;
use crate::provider::RecordQuery;
use crate::store::{CachedContent, ContentStore};

#[derive(Clone)]
pub struct RecordCache {
    pool: SqlitePool,
    store: ContentStore,
}

impl RecordCache {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let store = ContentStore::open(&config.cache.dir)?;
        Ok(Self::new(pool, store))
    }

    pub fn new(pool: SqlitePool, store: ContentStore) -> Self {
        Self { pool, store }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// The cached identify descriptor, if the repository was ever polled.
    pub async fn identify(&self) -> Result<Option<CachedContent>> {
        let mut conn = self.pool.acquire().await?;
        let path = index::identify_path(&mut conn).await?;
        Ok(path.map(|p| self.store.read(&p, None, false)))
    }

    /// A committed record, with its datestamp rewritten to the commit date.
    pub async fn record(&self, identifier: &str, prefix: &str) -> Result<Option<CachedContent>> {
        let mut conn = self.pool.acquire().await?;
        let info = index::record_info(&mut conn, identifier, prefix).await?;
        Ok(info.map(|i| self.store.read(&i.path, Some(&i.datestamp), false)))
    }

    pub async fn formats(&self, identifier: Option<&str>) -> Result<Vec<CachedFormat>> {
        let mut conn = self.pool.acquire().await?;
        index::formats(&mut conn, identifier).await
    }

    pub async fn item_exists(&self, identifier: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        index::item_exists(&mut conn, identifier).await
    }

    pub async fn format_exists(&self, prefix: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(index::format_key(&mut conn, prefix).await?.is_some())
    }

    pub async fn has_sets(&self) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(!index::set_specs(&mut conn).await?.is_empty())
    }

    pub async fn record_paths(&self, query: &RecordQuery, page_size: usize) -> Result<PathCursor> {
        index::find_records(
            &self.pool,
            query.from,
            query.until,
            &query.prefix,
            query.set.as_deref(),
            page_size,
        )
        .await
    }

    pub async fn set_paths(&self, page_size: usize) -> Result<PathCursor> {
        index::find_sets(&self.pool, page_size).await
    }
}
