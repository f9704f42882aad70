//! Implementations of the `rcache` subcommands.
//!
//! Each `run_*` function opens what it needs from the configuration, does
//! its work and prints the result to stdout.

use anyhow::{bail, Result};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::RecordCache;
use crate::config::Config;
use crate::db;
use crate::index;
use crate::responder::{write_formats, ListArgs, Responder};
use crate::session::ResponsePart;
use crate::session_manager::SessionManager;
use crate::source::RepositorySource;
use crate::source_fs::DirectorySource;
use crate::store::ContentStore;
use crate::updater::{self, Updater};

fn open_source(config: &Config) -> Result<Arc<dyn RepositorySource>> {
    let Some(source) = &config.source else {
        bail!("No [source] section in the configuration; nothing to harvest from");
    };
    Ok(Arc::new(DirectorySource::new(source)?))
}

async fn open_updater(config: &Config) -> Result<Updater> {
    let pool = db::connect(config).await?;
    let store = ContentStore::open(&config.cache.dir)?;
    let source = open_source(config)?;
    Ok(Updater::new(pool, store, source, config.updater.clone()))
}

async fn open_responder(config: &Config) -> Result<Responder> {
    let cache = RecordCache::open(config).await?;
    let sessions = Arc::new(SessionManager::new(&config.sessions)?);
    Ok(Responder::new(cache, sessions, config.responder.clone()))
}

/// Run a single update cycle now.
pub async fn run_update(config: &Config) -> Result<()> {
    let updater = open_updater(config).await?;
    let report = updater.run_cycle().await?;

    println!("Update cycle complete.");
    println!("  rounds:     {}", report.rounds);
    println!("  processed:  {}", report.processed);
    println!("  failed:     {}", report.failed);
    println!("  retried:    {}", report.retried);
    println!("  queued:     {}", report.queued);
    println!("  polled:     {}", if report.polled { "yes" } else { "no" });
    println!("  pruned:     {}", report.pruned);
    Ok(())
}

/// Run the updater until Ctrl-C, which requests an immediate shutdown.
pub async fn run_daemon(config: &Config) -> Result<()> {
    let updater = open_updater(config).await?;
    let handle = updater.spawn();
    tracing::info!(poll_seconds = config.updater.poll_seconds, "updater running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!(state = %handle.state(), "shutting down");
    handle.shutdown(true);
    handle.join().await
}

pub async fn run_polling(config: &Config, enabled: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut conn = pool.acquire().await?;
    index::set_polling_enabled(&mut conn, enabled).await?;
    drop(conn);
    pool.close().await;
    println!("Polling {}.", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

pub async fn run_prune(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = ContentStore::open(&config.cache.dir)?;
    let removed = updater::prune(&pool, &store, &CancellationToken::new()).await?;
    pool.close().await;
    println!("Pruned {} file(s).", removed);
    Ok(())
}

pub async fn run_get_record(config: &Config, identifier: &str, prefix: &str) -> Result<()> {
    let responder = open_responder(config).await?;
    let content = responder.get_record(identifier, prefix).await?;
    let mut out = std::io::stdout().lock();
    content.write_to(&mut out)?;
    writeln!(out)?;
    Ok(())
}

pub async fn run_identify(config: &Config) -> Result<()> {
    let responder = open_responder(config).await?;
    let content = responder.identify().await?;
    let mut out = std::io::stdout().lock();
    content.write_to(&mut out)?;
    writeln!(out)?;
    Ok(())
}

pub async fn run_formats(config: &Config, identifier: Option<&str>) -> Result<()> {
    let responder = open_responder(config).await?;
    let formats = responder.list_metadata_formats(identifier).await?;
    write_formats(&formats, &mut std::io::stdout().lock())
}

/// Print every part of a record or identifier list, following resumption
/// tokens to the end.
pub async fn run_list_records(config: &Config, args: ListArgs, identifiers_only: bool) -> Result<()> {
    let responder = open_responder(config).await?;
    let mut part = if identifiers_only {
        responder.list_identifiers(&args).await?
    } else {
        responder.list_records(&args).await?
    };

    loop {
        print_part(&responder, &part)?;
        let Some(token) = part.token().map(str::to_string) else {
            break;
        };
        let next = ListArgs {
            resumption_token: Some(token),
            ..Default::default()
        };
        part = if identifiers_only {
            responder.list_identifiers(&next).await?
        } else {
            responder.list_records(&next).await?
        };
    }
    responder.close().await;
    Ok(())
}

pub async fn run_list_sets(config: &Config) -> Result<()> {
    let responder = open_responder(config).await?;
    let mut part = responder.list_sets(None).await?;
    loop {
        print_part(&responder, &part)?;
        let Some(token) = part.token().map(str::to_string) else {
            break;
        };
        part = responder.list_sets(Some(&token)).await?;
    }
    responder.close().await;
    Ok(())
}

fn print_part(responder: &Responder, part: &ResponsePart) -> Result<()> {
    let mut out = std::io::stdout().lock();
    part.write_to(responder.cache().store(), &mut out)?;
    out.flush()?;
    Ok(())
}

/// Dump the pending queue in its flat-file form.
pub async fn run_queue(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut conn = pool.acquire().await?;
    let mut out = std::io::stdout();
    let count = index::dump_queue(&mut conn, &mut out).await?;
    drop(conn);
    pool.close().await;
    eprintln!("{} queued item(s)", count);
    Ok(())
}

pub async fn run_failures(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut conn = pool.acquire().await?;
    let failures = index::failures(&mut conn).await?;
    drop(conn);
    pool.close().await;

    if failures.is_empty() {
        println!("No failures.");
        return Ok(());
    }

    println!(
        "{:<40} {:<12} {:>5}  {:<25}  {}",
        "IDENTIFIER", "PREFIX", "COUNT", "LAST FAILURE", "REASON"
    );
    for f in &failures {
        println!(
            "{:<40} {:<12} {:>5}  {:<25}  {}",
            f.identifier, f.prefix, f.fail_count, f.last_fail_date, f.last_fail_reason
        );
    }
    Ok(())
}
