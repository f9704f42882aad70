//! The relational index of cached items, formats, sets and records, plus the
//! pending-work queue, failure bookkeeping and the list of prunable files.
//!
//! Every operation takes a `&mut SqliteConnection` so the caller decides the
//! transaction boundary: pass `&mut *tx` for a transaction obtained from
//! `pool.begin()`, or `&mut *conn` for an autocommit connection.
//!
//! Dates are stored as epoch milliseconds, except failure dates which are
//! kept as RFC 3339 text for operators.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;

use crate::models::{
    format_datestamp, CachedFormat, FailureInfo, MetadataFormat, Prunable, QueueOrigin,
    RecordInfo, RemoteRecord,
};
use crate::record::ParsedRecord;

// ═══════════════════════════════════════════════════════════════════════
// Administrative row
// ═══════════════════════════════════════════════════════════════════════

pub async fn polling_enabled(conn: &mut SqliteConnection) -> Result<bool> {
    let enabled: Option<i64> = sqlx::query_scalar("SELECT polling_enabled FROM admin WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(enabled.map_or(true, |v| v != 0))
}

pub async fn set_polling_enabled(conn: &mut SqliteConnection, enabled: bool) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO admin (id, identify_path, polling_enabled) VALUES (1, NULL, ?)
        ON CONFLICT(id) DO UPDATE SET polling_enabled = excluded.polling_enabled
        "#,
    )
    .bind(enabled as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn identify_path(conn: &mut SqliteConnection) -> Result<Option<String>> {
    let path: Option<Option<String>> =
        sqlx::query_scalar("SELECT identify_path FROM admin WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?;
    Ok(path.flatten())
}

/// Point the identify descriptor at `path`; the previous file becomes prunable.
pub async fn set_identify_path(conn: &mut SqliteConnection, path: &str) -> Result<()> {
    if let Some(old) = identify_path(&mut *conn).await? {
        if old != path {
            add_prunable(&mut *conn, &old).await?;
        }
    }
    sqlx::query(
        r#"
        INSERT INTO admin (id, identify_path, polling_enabled) VALUES (1, ?, 1)
        ON CONFLICT(id) DO UPDATE SET identify_path = excluded.identify_path
        "#,
    )
    .bind(path)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Formats
// ═══════════════════════════════════════════════════════════════════════

/// Insert a format, or update its namespace/schema if they changed.
pub async fn put_format(conn: &mut SqliteConnection, format: &MetadataFormat) -> Result<()> {
    let existing = sqlx::query(
        "SELECT namespace_uri, schema_location FROM formats WHERE md_prefix = ?",
    )
    .bind(&format.prefix)
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        Some(row) => {
            let uri: String = row.get("namespace_uri");
            let loc: String = row.get("schema_location");
            if uri != format.namespace_uri || loc != format.schema_location {
                tracing::info!(prefix = %format.prefix, "updating metadata format");
                sqlx::query(
                    "UPDATE formats SET namespace_uri = ?, schema_location = ? WHERE md_prefix = ?",
                )
                .bind(&format.namespace_uri)
                .bind(&format.schema_location)
                .bind(&format.prefix)
                .execute(&mut *conn)
                .await?;
            }
        }
        None => {
            tracing::info!(prefix = %format.prefix, "adding metadata format");
            sqlx::query(
                r#"
                INSERT INTO formats (md_prefix, namespace_uri, schema_location, last_poll_date)
                VALUES (?, ?, ?, 0)
                "#,
            )
            .bind(&format.prefix)
            .bind(&format.namespace_uri)
            .bind(&format.schema_location)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Delete a format along with its records and their memberships. Record
/// files become prunable, and pending work for the format is dropped.
pub async fn delete_format(conn: &mut SqliteConnection, prefix: &str) -> Result<()> {
    let Some(format_key) = format_key(&mut *conn, prefix).await? else {
        bail!("Format does not exist: {}", prefix);
    };
    tracing::info!(prefix, "deleting metadata format");

    sqlx::query(
        "DELETE FROM memberships WHERE record_key IN (SELECT record_key FROM records WHERE format_key = ?)",
    )
    .bind(format_key)
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO prunables (xml_path) SELECT xml_path FROM records WHERE format_key = ?")
        .bind(format_key)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM records WHERE format_key = ?")
        .bind(format_key)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM queue WHERE md_prefix = ?")
        .bind(prefix)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM failures WHERE md_prefix = ?")
        .bind(prefix)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM formats WHERE format_key = ?")
        .bind(format_key)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn format_key(conn: &mut SqliteConnection, prefix: &str) -> Result<Option<i64>> {
    Ok(
        sqlx::query_scalar("SELECT format_key FROM formats WHERE md_prefix = ?")
            .bind(prefix)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn format_key_map(conn: &mut SqliteConnection) -> Result<HashMap<String, i64>> {
    let rows = sqlx::query("SELECT md_prefix, format_key FROM formats")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("md_prefix"), row.get("format_key")))
        .collect())
}

/// All formats, or only those an item has records in.
pub async fn formats(
    conn: &mut SqliteConnection,
    identifier: Option<&str>,
) -> Result<Vec<CachedFormat>> {
    let rows = match identifier {
        None => {
            sqlx::query(
                r#"
                SELECT format_key, md_prefix, namespace_uri, schema_location, last_poll_date
                FROM formats ORDER BY md_prefix
                "#,
            )
            .fetch_all(&mut *conn)
            .await?
        }
        Some(identifier) => {
            sqlx::query(
                r#"
                SELECT f.format_key, f.md_prefix, f.namespace_uri, f.schema_location, f.last_poll_date
                FROM formats f
                JOIN records r ON r.format_key = f.format_key
                JOIN items i ON i.item_key = r.item_key
                WHERE i.identifier = ?
                ORDER BY f.md_prefix
                "#,
            )
            .bind(identifier)
            .fetch_all(&mut *conn)
            .await?
        }
    };

    Ok(rows
        .iter()
        .map(|row| CachedFormat {
            key: row.get("format_key"),
            prefix: row.get("md_prefix"),
            namespace_uri: row.get("namespace_uri"),
            schema_location: row.get("schema_location"),
            last_poll_date: row.get("last_poll_date"),
        })
        .collect())
}

/// The oldest per-format poll watermark, or 0 when no format exists.
pub async fn earliest_poll_date(conn: &mut SqliteConnection) -> Result<i64> {
    let earliest: Option<i64> = sqlx::query_scalar("SELECT MIN(last_poll_date) FROM formats")
        .fetch_one(&mut *conn)
        .await?;
    Ok(earliest.unwrap_or(0))
}

pub async fn last_poll_date(conn: &mut SqliteConnection, prefix: &str) -> Result<i64> {
    let date: Option<i64> = sqlx::query_scalar("SELECT last_poll_date FROM formats WHERE md_prefix = ?")
        .bind(prefix)
        .fetch_optional(&mut *conn)
        .await?;
    date.ok_or_else(|| anyhow!("Format does not exist: {}", prefix))
}

pub async fn set_last_poll_date(conn: &mut SqliteConnection, prefix: &str, millis: i64) -> Result<()> {
    sqlx::query("UPDATE formats SET last_poll_date = ? WHERE md_prefix = ?")
        .bind(millis)
        .bind(prefix)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Sets
// ═══════════════════════════════════════════════════════════════════════

/// Insert or repoint a set descriptor; a replaced descriptor becomes prunable.
pub async fn put_set(conn: &mut SqliteConnection, spec: &str, path: &str) -> Result<()> {
    match set_info(&mut *conn, spec).await? {
        Some(old) => {
            sqlx::query("UPDATE sets SET xml_path = ? WHERE set_spec = ?")
                .bind(path)
                .bind(spec)
                .execute(&mut *conn)
                .await?;
            if old != path {
                add_prunable(&mut *conn, &old).await?;
            }
        }
        None => {
            sqlx::query("INSERT INTO sets (set_spec, xml_path) VALUES (?, ?)")
                .bind(spec)
                .bind(path)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

/// Descriptor path of a set.
pub async fn set_info(conn: &mut SqliteConnection, spec: &str) -> Result<Option<String>> {
    Ok(
        sqlx::query_scalar("SELECT xml_path FROM sets WHERE set_spec = ?")
            .bind(spec)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn set_specs(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar("SELECT set_spec FROM sets ORDER BY set_spec")
        .fetch_all(&mut *conn)
        .await?)
}

/// Remove a set and its memberships; its descriptor becomes prunable.
pub async fn delete_set(conn: &mut SqliteConnection, spec: &str) -> Result<()> {
    let row = sqlx::query("SELECT set_key, xml_path FROM sets WHERE set_spec = ?")
        .bind(spec)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        bail!("Set does not exist: {}", spec);
    };
    let set_key: i64 = row.get("set_key");
    let path: String = row.get("xml_path");

    add_prunable(&mut *conn, &path).await?;
    sqlx::query("DELETE FROM memberships WHERE set_key = ?")
        .bind(set_key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM sets WHERE set_key = ?")
        .bind(set_key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// The subset of `specs` the index does not know about.
pub async fn missing_sets(conn: &mut SqliteConnection, specs: &[String]) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for spec in specs {
        if set_info(&mut *conn, spec).await?.is_none() {
            missing.push(spec.clone());
        }
    }
    Ok(missing)
}

// ═══════════════════════════════════════════════════════════════════════
// Items and records
// ═══════════════════════════════════════════════════════════════════════

pub async fn item_exists(conn: &mut SqliteConnection, identifier: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT item_key FROM items WHERE identifier = ?")
        .bind(identifier)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn item_key_or_create(conn: &mut SqliteConnection, identifier: &str) -> Result<i64> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT item_key FROM items WHERE identifier = ?")
        .bind(identifier)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(key) = existing {
        return Ok(key);
    }
    let result = sqlx::query("INSERT INTO items (identifier) VALUES (?)")
        .bind(identifier)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Add or replace the record of an item in a format.
///
/// The record is left with a NULL commit date until
/// [`set_uncommitted_record_dates`] stamps it. A replaced content path becomes
/// prunable and set membership is reconciled against the record's sets.
pub async fn put_record(
    conn: &mut SqliteConnection,
    record: &ParsedRecord,
    format_keys: &HashMap<String, i64>,
) -> Result<()> {
    let format_key = *format_keys
        .get(&record.prefix)
        .ok_or_else(|| anyhow!("No such format: {}", record.prefix))?;

    let item_key = item_key_or_create(&mut *conn, &record.identifier).await?;

    let mut set_keys: HashSet<i64> = HashSet::new();
    for spec in &record.set_specs {
        let key: Option<i64> = sqlx::query_scalar("SELECT set_key FROM sets WHERE set_spec = ?")
            .bind(spec)
            .fetch_optional(&mut *conn)
            .await?;
        match key {
            Some(key) => {
                set_keys.insert(key);
            }
            None => bail!(
                "Record {} refers to set '{}' which the repository does not list",
                record.identifier,
                spec
            ),
        }
    }

    let existing = sqlx::query("SELECT record_key, xml_path FROM records WHERE item_key = ? AND format_key = ?")
        .bind(item_key)
        .bind(format_key)
        .fetch_optional(&mut *conn)
        .await?;

    let (record_key, current_sets) = match existing {
        Some(row) => {
            let record_key: i64 = row.get("record_key");
            let old_path: String = row.get("xml_path");

            sqlx::query("UPDATE records SET mod_date = NULL, xml_path = ? WHERE record_key = ?")
                .bind(&record.path)
                .bind(record_key)
                .execute(&mut *conn)
                .await?;
            if old_path != record.path {
                add_prunable(&mut *conn, &old_path).await?;
            }

            let current: Vec<i64> =
                sqlx::query_scalar("SELECT set_key FROM memberships WHERE record_key = ?")
                    .bind(record_key)
                    .fetch_all(&mut *conn)
                    .await?;
            (record_key, current.into_iter().collect::<HashSet<i64>>())
        }
        None => {
            let result = sqlx::query(
                "INSERT INTO records (item_key, format_key, mod_date, xml_path) VALUES (?, ?, NULL, ?)",
            )
            .bind(item_key)
            .bind(format_key)
            .bind(&record.path)
            .execute(&mut *conn)
            .await?;
            (result.last_insert_rowid(), HashSet::new())
        }
    };

    for added in set_keys.difference(&current_sets) {
        sqlx::query("INSERT OR IGNORE INTO memberships (set_key, record_key) VALUES (?, ?)")
            .bind(*added)
            .bind(record_key)
            .execute(&mut *conn)
            .await?;
    }
    for removed in current_sets.difference(&set_keys) {
        sqlx::query("DELETE FROM memberships WHERE set_key = ? AND record_key = ?")
            .bind(*removed)
            .bind(record_key)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

/// Stamp every record whose commit date is still NULL. Returns the number
/// of records stamped.
pub async fn set_uncommitted_record_dates(conn: &mut SqliteConnection, millis: i64) -> Result<u64> {
    let result = sqlx::query("UPDATE records SET mod_date = ? WHERE mod_date IS NULL")
        .bind(millis)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Content path and presentation datestamp of one committed record.
pub async fn record_info(
    conn: &mut SqliteConnection,
    identifier: &str,
    prefix: &str,
) -> Result<Option<RecordInfo>> {
    let row = sqlx::query(
        r#"
        SELECT r.xml_path, r.mod_date
        FROM records r
        JOIN items i ON i.item_key = r.item_key
        JOIN formats f ON f.format_key = r.format_key
        WHERE i.identifier = ? AND f.md_prefix = ? AND r.mod_date IS NOT NULL
        "#,
    )
    .bind(identifier)
    .bind(prefix)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| RecordInfo {
        path: row.get("xml_path"),
        datestamp: format_datestamp(row.get("mod_date")),
    }))
}

// ═══════════════════════════════════════════════════════════════════════
// Cursors
// ═══════════════════════════════════════════════════════════════════════

/// One entry of a list result: a content path, and for records the
/// datestamp to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub path: String,
    pub datestamp: Option<String>,
}

enum CursorQuery {
    Records {
        format_key: i64,
        set_key: Option<i64>,
        from: i64,
        until: i64,
    },
    Sets,
}

/// A lazy cursor over content paths, read page by page in key order.
///
/// Each page borrows a pool connection only for the query that fetches it,
/// so an idle cursor holds no database resources. Entries committed while
/// the cursor is open show up if their key sorts after the last one read.
pub struct PathCursor {
    pool: Option<SqlitePool>,
    query: CursorQuery,
    page_size: i64,
    last_key: i64,
    buffer: VecDeque<PathEntry>,
    exhausted: bool,
}

impl PathCursor {
    fn new(pool: &SqlitePool, query: CursorQuery, page_size: usize) -> Self {
        Self {
            pool: Some(pool.clone()),
            query,
            page_size: page_size.max(1) as i64,
            last_key: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn empty() -> Self {
        Self {
            pool: None,
            query: CursorQuery::Sets,
            page_size: 1,
            last_key: 0,
            buffer: VecDeque::new(),
            exhausted: true,
        }
    }

    pub async fn next(&mut self) -> Result<Option<PathEntry>> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    pub async fn peek(&mut self) -> Result<Option<&PathEntry>> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }
        Ok(self.buffer.front())
    }

    /// Stop reading. Buffered entries are dropped.
    pub async fn close(self) -> Result<()> {
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        let Some(pool) = &self.pool else {
            self.exhausted = true;
            return Ok(());
        };
        let mut conn = pool.acquire().await?;

        let rows = match &self.query {
            CursorQuery::Records {
                format_key,
                set_key,
                from,
                until,
            } => {
                sqlx::query(
                    r#"
                    SELECT r.record_key AS k, r.xml_path AS path, r.mod_date AS mod_date
                    FROM records r
                    WHERE r.format_key = ?
                      AND r.record_key > ?
                      AND r.mod_date IS NOT NULL
                      AND r.mod_date >= ?
                      AND r.mod_date <= ?
                      AND (? IS NULL OR EXISTS (
                          SELECT 1 FROM memberships m
                          WHERE m.record_key = r.record_key AND m.set_key = ?))
                    ORDER BY r.record_key
                    LIMIT ?
                    "#,
                )
                .bind(*format_key)
                .bind(self.last_key)
                .bind(*from)
                .bind(*until)
                .bind(*set_key)
                .bind(*set_key)
                .bind(self.page_size)
                .fetch_all(&mut *conn)
                .await?
            }
            CursorQuery::Sets => {
                sqlx::query(
                    r#"
                    SELECT set_key AS k, xml_path AS path, NULL AS mod_date
                    FROM sets
                    WHERE set_key > ?
                    ORDER BY set_key
                    LIMIT ?
                    "#,
                )
                .bind(self.last_key)
                .bind(self.page_size)
                .fetch_all(&mut *conn)
                .await?
            }
        };
        drop(conn);

        if (rows.len() as i64) < self.page_size {
            self.exhausted = true;
        }
        for row in rows {
            self.last_key = row.get("k");
            let mod_date: Option<i64> = row.get("mod_date");
            self.buffer.push_back(PathEntry {
                path: row.get("path"),
                datestamp: mod_date.map(format_datestamp),
            });
        }
        Ok(())
    }
}

/// Records of `prefix` committed within `[from, until]`, optionally limited to
/// members of `set`.
///
/// When `from` equals `until` the window is widened to cover the whole second.
/// An unknown format or set yields an empty cursor.
pub async fn find_records(
    pool: &SqlitePool,
    from: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    prefix: &str,
    set: Option<&str>,
    page_size: usize,
) -> Result<PathCursor> {
    let from_ms = from.map_or(i64::MIN, |d| d.timestamp_millis());
    let mut until_ms = until.map_or(i64::MAX, |d| d.timestamp_millis());
    if from.is_some() && from_ms == until_ms {
        until_ms += 999;
    }

    let mut conn = pool.acquire().await.context("Failed to acquire a connection")?;

    let Some(format_key) = format_key(&mut conn, prefix).await? else {
        return Ok(PathCursor::empty());
    };

    let set_key = match set {
        None => None,
        Some(spec) => {
            let key: Option<i64> = sqlx::query_scalar("SELECT set_key FROM sets WHERE set_spec = ?")
                .bind(spec)
                .fetch_optional(&mut *conn)
                .await?;
            match key {
                Some(key) => Some(key),
                None => return Ok(PathCursor::empty()),
            }
        }
    };

    Ok(PathCursor::new(
        pool,
        CursorQuery::Records {
            format_key,
            set_key,
            from: from_ms,
            until: until_ms,
        },
        page_size,
    ))
}

/// Descriptor paths of every set.
pub async fn find_sets(pool: &SqlitePool, page_size: usize) -> Result<PathCursor> {
    Ok(PathCursor::new(pool, CursorQuery::Sets, page_size))
}

// ═══════════════════════════════════════════════════════════════════════
// Work queue
// ═══════════════════════════════════════════════════════════════════════

fn check_queue_fields(identifier: &str, prefix: &str, source_info: &str) -> Result<()> {
    if source_info.contains('\n') || source_info.contains('\r') {
        bail!("sourceInfo may not contain a line break: {:?}", source_info);
    }
    if identifier.is_empty() || identifier.contains(char::is_whitespace) {
        bail!("Identifier may not be empty or contain whitespace: {:?}", identifier);
    }
    if prefix.is_empty() || prefix.contains(char::is_whitespace) {
        bail!("Metadata prefix may not be empty or contain whitespace: {:?}", prefix);
    }
    Ok(())
}

/// Queue a record that changed remotely.
///
/// If the pair is currently marked failed, the failure row is folded into
/// the queue entry so the pair is never both pending and failed.
pub async fn queue_remote_record(conn: &mut SqliteConnection, record: &RemoteRecord) -> Result<()> {
    check_queue_fields(&record.identifier, &record.prefix, &record.source_info)?;

    sqlx::query(
        r#"
        INSERT INTO queue (identifier, md_prefix, source_info, origin, prior_failures)
        VALUES (?, ?, ?, ?, COALESCE(
            (SELECT fail_count FROM failures WHERE identifier = ? AND md_prefix = ?), 0))
        "#,
    )
    .bind(&record.identifier)
    .bind(&record.prefix)
    .bind(&record.source_info)
    .bind(QueueOrigin::Remote.tag().to_string())
    .bind(&record.identifier)
    .bind(&record.prefix)
    .execute(&mut *conn)
    .await?;

    remove_failure(&mut *conn, &record.identifier, &record.prefix).await?;
    Ok(())
}

/// Move failures with at most `max_retries` attempts back onto the queue.
/// Returns the number of entries queued.
pub async fn queue_failed_records(conn: &mut SqliteConnection, max_retries: i64) -> Result<u64> {
    if max_retries <= 0 {
        return Ok(0);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO queue (identifier, md_prefix, source_info, origin, prior_failures)
        SELECT identifier, md_prefix, source_info, ?, fail_count
        FROM failures
        WHERE fail_count <= ?
        ORDER BY last_fail_date
        "#,
    )
    .bind(QueueOrigin::Failed.tag().to_string())
    .bind(max_retries)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM failures WHERE fail_count <= ?")
        .bind(max_retries)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

pub async fn queue_size(conn: &mut SqliteConnection) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM queue")
        .fetch_one(&mut *conn)
        .await?)
}

/// Stream the queue, oldest first, as `<key> <identifier> <prefix> <origin> <sourceInfo>`
/// lines. Returns the number of lines written.
pub async fn dump_queue(conn: &mut SqliteConnection, out: &mut (dyn Write + Send)) -> Result<usize> {
    let mut rows = sqlx::query(
        "SELECT queue_key, identifier, md_prefix, origin, source_info FROM queue ORDER BY queue_key",
    )
    .fetch(&mut *conn);

    let mut count = 0;
    while let Some(row) = rows.try_next().await? {
        let key: i64 = row.get("queue_key");
        let identifier: String = row.get("identifier");
        let prefix: String = row.get("md_prefix");
        let origin: String = row.get("origin");
        let source_info: String = row.get("source_info");
        writeln!(out, "{} {} {} {} {}", key, identifier, prefix, origin, source_info)?;
        count += 1;
    }
    Ok(count)
}

/// Delete a queue entry, returning the failure count it carried.
pub async fn remove_from_queue(conn: &mut SqliteConnection, queue_key: i64) -> Result<Option<i64>> {
    Ok(
        sqlx::query_scalar("DELETE FROM queue WHERE queue_key = ? RETURNING prior_failures")
            .bind(queue_key)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

// ═══════════════════════════════════════════════════════════════════════
// Failures
// ═══════════════════════════════════════════════════════════════════════

pub async fn remove_failure(conn: &mut SqliteConnection, identifier: &str, prefix: &str) -> Result<()> {
    sqlx::query("DELETE FROM failures WHERE identifier = ? AND md_prefix = ?")
        .bind(identifier)
        .bind(prefix)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Attempt count of a failed pair, or `None` if it is not marked failed.
pub async fn fail_count(conn: &mut SqliteConnection, identifier: &str, prefix: &str) -> Result<Option<i64>> {
    Ok(
        sqlx::query_scalar("SELECT fail_count FROM failures WHERE identifier = ? AND md_prefix = ?")
            .bind(identifier)
            .bind(prefix)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn add_failure(
    conn: &mut SqliteConnection,
    identifier: &str,
    prefix: &str,
    source_info: &str,
    fail_count: i64,
    date: DateTime<Utc>,
    reason: &str,
) -> Result<()> {
    let date = date.to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO failures
            (identifier, md_prefix, source_info, fail_count, first_fail_date, last_fail_date, last_fail_reason)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(identifier)
    .bind(prefix)
    .bind(source_info)
    .bind(fail_count)
    .bind(&date)
    .bind(&date)
    .bind(reason)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn update_failure(
    conn: &mut SqliteConnection,
    identifier: &str,
    prefix: &str,
    source_info: &str,
    fail_count: i64,
    date: DateTime<Utc>,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE failures
        SET source_info = ?, fail_count = ?, last_fail_date = ?, last_fail_reason = ?
        WHERE identifier = ? AND md_prefix = ?
        "#,
    )
    .bind(source_info)
    .bind(fail_count)
    .bind(date.to_rfc3339())
    .bind(reason)
    .bind(identifier)
    .bind(prefix)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn failures(conn: &mut SqliteConnection) -> Result<Vec<FailureInfo>> {
    let rows = sqlx::query(
        r#"
        SELECT identifier, md_prefix, source_info, fail_count,
               first_fail_date, last_fail_date, last_fail_reason
        FROM failures ORDER BY identifier, md_prefix
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| FailureInfo {
            identifier: row.get("identifier"),
            prefix: row.get("md_prefix"),
            source_info: row.get("source_info"),
            fail_count: row.get("fail_count"),
            first_fail_date: row.get("first_fail_date"),
            last_fail_date: row.get("last_fail_date"),
            last_fail_reason: row.get("last_fail_reason"),
        })
        .collect())
}

// ═══════════════════════════════════════════════════════════════════════
// Prunables
// ═══════════════════════════════════════════════════════════════════════

pub async fn add_prunable(conn: &mut SqliteConnection, path: &str) -> Result<()> {
    sqlx::query("INSERT INTO prunables (xml_path) VALUES (?)")
        .bind(path)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn prunable_count(conn: &mut SqliteConnection) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM prunables")
        .fetch_one(&mut *conn)
        .await?)
}

/// Up to `limit` prunables with a key greater than `after`, in key order.
pub async fn prunables_after(conn: &mut SqliteConnection, after: i64, limit: i64) -> Result<Vec<Prunable>> {
    let rows = sqlx::query(
        "SELECT prune_key, xml_path FROM prunables WHERE prune_key > ? ORDER BY prune_key LIMIT ?",
    )
    .bind(after)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Prunable {
            key: row.get("prune_key"),
            path: row.get("xml_path"),
        })
        .collect())
}

pub async fn delete_prunables(conn: &mut SqliteConnection, keys: &[i64]) -> Result<()> {
    for key in keys {
        sqlx::query("DELETE FROM prunables WHERE prune_key = ?")
            .bind(*key)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Write every prunable as a `<key> <path>` line. Returns the number written.
pub async fn dump_prunables(conn: &mut SqliteConnection, out: &mut (dyn Write + Send)) -> Result<usize> {
    let mut rows = sqlx::query("SELECT prune_key, xml_path FROM prunables ORDER BY prune_key")
        .fetch(&mut *conn);
    let mut count = 0;
    while let Some(row) = rows.try_next().await? {
        let key: i64 = row.get("prune_key");
        let path: String = row.get("xml_path");
        writeln!(out, "{} {}", key, path)?;
        count += 1;
    }
    Ok(count)
}
