use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index used by the cache. Safe to run repeatedly.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Single administrative row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS admin (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            identify_path TEXT,
            polling_enabled INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO admin (id, identify_path, polling_enabled) VALUES (1, NULL, 1)")
        .execute(pool)
        .await?;

    // last_poll_date is the remote watermark in epoch milliseconds; 0 = never polled
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS formats (
            format_key INTEGER PRIMARY KEY AUTOINCREMENT,
            md_prefix TEXT NOT NULL UNIQUE,
            namespace_uri TEXT NOT NULL,
            schema_location TEXT NOT NULL,
            last_poll_date INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            item_key INTEGER PRIMARY KEY AUTOINCREMENT,
            identifier TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // mod_date is NULL until the committing transaction stamps it
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            record_key INTEGER PRIMARY KEY AUTOINCREMENT,
            item_key INTEGER NOT NULL,
            format_key INTEGER NOT NULL,
            mod_date INTEGER,
            xml_path TEXT NOT NULL,
            UNIQUE(item_key, format_key),
            FOREIGN KEY (item_key) REFERENCES items(item_key),
            FOREIGN KEY (format_key) REFERENCES formats(format_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sets (
            set_key INTEGER PRIMARY KEY AUTOINCREMENT,
            set_spec TEXT NOT NULL UNIQUE,
            xml_path TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memberships (
            set_key INTEGER NOT NULL,
            record_key INTEGER NOT NULL,
            PRIMARY KEY (set_key, record_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // origin: 'R' = changed remotely, 'F' = retried failure
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue (
            queue_key INTEGER PRIMARY KEY AUTOINCREMENT,
            identifier TEXT NOT NULL,
            md_prefix TEXT NOT NULL,
            source_info TEXT NOT NULL,
            origin TEXT NOT NULL,
            prior_failures INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS failures (
            identifier TEXT NOT NULL,
            md_prefix TEXT NOT NULL,
            source_info TEXT NOT NULL,
            fail_count INTEGER NOT NULL,
            first_fail_date TEXT NOT NULL,
            last_fail_date TEXT NOT NULL,
            last_fail_reason TEXT NOT NULL,
            PRIMARY KEY (identifier, md_prefix)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prunables (
            prune_key INTEGER PRIMARY KEY AUTOINCREMENT,
            xml_path TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_format_date ON records(format_key, mod_date)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_mod_date_null ON records(mod_date) WHERE mod_date IS NULL")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memberships_record ON memberships(record_key)")
        .execute(pool)
        .await?;

    Ok(())
}
