//! Cache statistics and health overview.
//!
//! Summarizes what the cache holds: formats, items, records, sets, pending
//! work, failures and files awaiting pruning. Used by `rcache stats` to show
//! whether harvesting is keeping up.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::store::ContentStore;

#[derive(Debug, Serialize)]
pub struct FormatStats {
    pub prefix: String,
    pub records: i64,
    /// Epoch milliseconds of the last successful poll; 0 if never polled.
    pub last_poll_date: i64,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub formats: i64,
    pub items: i64,
    pub records: i64,
    pub sets: i64,
    pub queued: i64,
    pub failures: i64,
    pub prunables: i64,
    pub content_files: usize,
    pub db_size_bytes: u64,
    pub polling_enabled: bool,
    pub by_format: Vec<FormatStats>,
}

async fn count(pool: &SqlitePool, table: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?)
}

/// Gather counts from the index and the content store.
pub async fn collect_stats(pool: &SqlitePool, store: &ContentStore, db_size_bytes: u64) -> Result<CacheStats> {
    let format_rows = sqlx::query(
        r#"
        SELECT f.md_prefix, f.last_poll_date, COUNT(r.record_key) AS record_count
        FROM formats f
        LEFT JOIN records r ON r.format_key = f.format_key
        GROUP BY f.format_key
        ORDER BY f.md_prefix
        "#,
    )
    .fetch_all(pool)
    .await?;

    let by_format = format_rows
        .iter()
        .map(|row| FormatStats {
            prefix: row.get("md_prefix"),
            records: row.get("record_count"),
            last_poll_date: row.get("last_poll_date"),
        })
        .collect();

    let mut conn = pool.acquire().await?;
    let polling_enabled = crate::index::polling_enabled(&mut conn).await?;
    drop(conn);

    Ok(CacheStats {
        formats: count(pool, "formats").await?,
        items: count(pool, "items").await?,
        records: count(pool, "records").await?,
        sets: count(pool, "sets").await?,
        queued: count(pool, "queue").await?,
        failures: count(pool, "failures").await?,
        prunables: count(pool, "prunables").await?,
        content_files: store.all_paths()?.len(),
        db_size_bytes,
        polling_enabled,
        by_format,
    })
}

/// Run the stats command: query the cache and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = ContentStore::open(&config.cache.dir)?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let stats = collect_stats(&pool, &store, db_size).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Record Cache Stats");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(stats.db_size_bytes));
    println!("  Content:     {} ({} files)", config.cache.dir.display(), stats.content_files);
    println!("  Polling:     {}", if stats.polling_enabled { "enabled" } else { "disabled" });
    println!();
    println!("  Items:       {}", stats.items);
    println!("  Records:     {}", stats.records);
    println!("  Sets:        {}", stats.sets);
    println!("  Queued:      {}", stats.queued);
    println!("  Failures:    {}", stats.failures);
    println!("  Prunable:    {}", stats.prunables);

    if !stats.by_format.is_empty() {
        println!();
        println!("  By format:");
        println!("  {:<24} {:>8}   {}", "PREFIX", "RECORDS", "LAST POLL");
        println!("  {}", "-".repeat(56));

        for f in &stats.by_format {
            let poll_display = if f.last_poll_date > 0 {
                format_ts_relative(f.last_poll_date / 1000)
            } else {
                "never".to_string()
            };
            println!("  {:<24} {:>8}   {}", f.prefix, f.records, poll_display);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
