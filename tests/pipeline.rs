//! End-to-end tests of the harvesting pipeline and the list session layer.
//!
//! An in-memory [`RepositorySource`] feeds a real updater writing to a
//! file-backed SQLite database and content store in a temp directory.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use record_cache::cache::RecordCache;
use record_cache::config::{
    CacheConfig, Config, DbConfig, ResponderConfig, SessionsConfig, UpdaterConfig,
};
use record_cache::error::protocol_error;
use record_cache::index;
use record_cache::migrate::create_schema;
use record_cache::models::{MetadataFormat, RemoteRecord, SetInfo};
use record_cache::record::RecordValidator;
use record_cache::responder::{ListArgs, Responder};
use record_cache::session::Resumption;
use record_cache::session_manager::SessionManager;
use record_cache::source::{RemoteRecords, RepositorySource};
use record_cache::stats::collect_stats;
use record_cache::store::ContentStore;
use record_cache::db;
use record_cache::updater::Updater;

// ═══════════════════════════════════════════════════════════════════════
// In-memory repository
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct MemRecord {
    identifier: String,
    prefix: String,
    modified: DateTime<Utc>,
    sets: Vec<String>,
    broken: bool,
}

#[derive(Default)]
struct MemoryRepository {
    formats: Mutex<Vec<MetadataFormat>>,
    sets: Mutex<Vec<SetInfo>>,
    records: Mutex<Vec<MemRecord>>,
}

fn base_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2005, 1, 1, 0, 0, 0).unwrap()
}

fn format(prefix: &str) -> MetadataFormat {
    MetadataFormat {
        prefix: prefix.to_string(),
        namespace_uri: format!("http://example.org/{prefix}/"),
        schema_location: format!("http://example.org/{prefix}.xsd"),
    }
}

impl MemoryRepository {
    fn new(prefixes: &[&str]) -> Arc<Self> {
        let repo = Self::default();
        *repo.formats.lock().unwrap() = prefixes.iter().map(|p| format(p)).collect();
        Arc::new(repo)
    }

    /// Add `count` items of `prefix`, one minute apart.
    fn add_items(&self, prefix: &str, count: usize, sets: &[&str]) {
        let mut records = self.records.lock().unwrap();
        for i in 0..count {
            records.push(MemRecord {
                identifier: format!("oai:example.org:item{i:03}"),
                prefix: prefix.to_string(),
                modified: base_date() + Duration::minutes(i as i64),
                sets: sets.iter().map(|s| s.to_string()).collect(),
                broken: false,
            });
        }
    }

    fn set_broken(&self, identifier: &str, broken: bool) {
        for r in self.records.lock().unwrap().iter_mut() {
            if r.identifier == identifier {
                r.broken = broken;
            }
        }
    }

    fn add_set(&self, spec: &str) {
        self.sets.lock().unwrap().push(SetInfo {
            spec: spec.to_string(),
            xml: format!("<set><setSpec>{spec}</setSpec><setName>{spec}</setName></set>"),
        });
    }

    fn remove_format(&self, prefix: &str) {
        self.formats.lock().unwrap().retain(|f| f.prefix != prefix);
        self.records.lock().unwrap().retain(|r| r.prefix != prefix);
    }

    /// Mark every record of `prefix` as modified at `when`.
    fn touch(&self, prefix: &str, when: DateTime<Utc>) {
        for r in self.records.lock().unwrap().iter_mut() {
            if r.prefix == prefix {
                r.modified = when;
            }
        }
    }

    fn record(&self, identifier: &str, prefix: &str) -> Option<MemRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.identifier == identifier && r.prefix == prefix)
            .cloned()
    }
}

fn record_xml(record: &MemRecord) -> String {
    let sets: String = record
        .sets
        .iter()
        .map(|s| format!("<setSpec>{s}</setSpec>"))
        .collect();
    format!(
        "<record><header><identifier>{}</identifier><datestamp>{}</datestamp>{}</header><metadata><dc/></metadata></record>",
        record.identifier,
        record.modified.format("%Y-%m-%dT%H:%M:%SZ"),
        sets
    )
}

#[async_trait]
impl RepositorySource for MemoryRepository {
    fn name(&self) -> &str {
        "memory"
    }

    async fn latest_change(&self) -> Result<DateTime<Utc>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.modified)
            .max()
            .unwrap_or(base_date()))
    }

    async fn list_formats(&self) -> Result<Vec<MetadataFormat>> {
        Ok(self.formats.lock().unwrap().clone())
    }

    async fn list_sets(&self) -> Result<Vec<SetInfo>> {
        Ok(self.sets.lock().unwrap().clone())
    }

    async fn list_changed_records(
        &self,
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        prefix: &str,
    ) -> Result<RemoteRecords> {
        let changed: Vec<Result<RemoteRecord>> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.prefix == prefix)
            .filter(|r| from.map_or(true, |f| r.modified > f) && r.modified <= until)
            .map(|r| {
                Ok(RemoteRecord {
                    identifier: r.identifier.clone(),
                    prefix: r.prefix.clone(),
                    source_info: format!("mem:{}", r.identifier),
                })
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(changed)))
    }

    async fn write_record_xml(
        &self,
        identifier: &str,
        prefix: &str,
        _source_info: &str,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let Some(record) = self.record(identifier, prefix) else {
            bail!("no such record: {identifier}");
        };
        if record.broken {
            bail!("connection reset while fetching {identifier}");
        }
        out.write_all(record_xml(&record).as_bytes())?;
        Ok(())
    }

    async fn write_identify_xml(&self, out: &mut (dyn Write + Send)) -> Result<()> {
        out.write_all(b"<Identify><repositoryName>memory</repositoryName></Identify>")?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Fixture
// ═══════════════════════════════════════════════════════════════════════

struct Fixture {
    _tmp: TempDir,
    config: Config,
    pool: sqlx::SqlitePool,
    store: ContentStore,
    repo: Arc<MemoryRepository>,
}

async fn fixture(repo: Arc<MemoryRepository>) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        db: DbConfig {
            path: tmp.path().join("cache.sqlite"),
        },
        cache: CacheConfig {
            dir: tmp.path().join("records"),
        },
        sessions: SessionsConfig {
            dir: tmp.path().join("sessions"),
            seconds_between_requests: 600,
            reap_interval_ms: 60_000,
            poll_interval_ms: 20,
        },
        responder: ResponderConfig {
            incomplete_record_list_size: 40,
            incomplete_identifier_list_size: 40,
            incomplete_set_list_size: 2,
        },
        updater: UpdaterConfig {
            max_workers: 4,
            max_work_batch_size: 50,
            max_commit_queue_size: 120,
            max_records_per_transaction: 60,
            handoff_poll_ms: 20,
            ..UpdaterConfig::default()
        },
        source: None,
    };

    let pool = db::connect(&config).await.unwrap();
    create_schema(&pool).await.unwrap();
    let store = ContentStore::open(&config.cache.dir).unwrap();

    Fixture {
        _tmp: tmp,
        config,
        pool,
        store,
        repo,
    }
}

impl Fixture {
    fn updater(&self) -> Updater {
        Updater::new(
            self.pool.clone(),
            self.store.clone(),
            self.repo.clone(),
            self.config.updater.clone(),
        )
    }

    fn responder(&self) -> Responder {
        let cache = RecordCache::new(self.pool.clone(), self.store.clone());
        let sessions = Arc::new(SessionManager::new(&self.config.sessions).unwrap());
        Responder::new(cache, sessions, self.config.responder.clone())
    }

    async fn failures(&self) -> Vec<String> {
        let mut conn = self.pool.acquire().await.unwrap();
        index::failures(&mut conn)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.identifier)
            .collect()
    }
}

fn list_args(prefix: &str) -> ListArgs {
    ListArgs {
        metadata_prefix: Some(prefix.to_string()),
        ..Default::default()
    }
}

fn token_args(token: &str) -> ListArgs {
    ListArgs {
        resumption_token: Some(token.to_string()),
        ..Default::default()
    }
}

fn code(err: &anyhow::Error) -> &'static str {
    protocol_error(err).map(|e| e.code()).unwrap_or("internal")
}

// ═══════════════════════════════════════════════════════════════════════
// Harvesting
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_harvest_with_failures_and_retry() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 150, &[]);
    repo.set_broken("oai:example.org:item007", true);
    repo.set_broken("oai:example.org:item077", true);
    let fx = fixture(repo.clone()).await;

    let report = fx.updater().run_cycle().await.unwrap();
    assert!(report.polled);
    assert_eq!(report.queued, 150);
    assert_eq!(report.failed, 2);
    assert!(!report.interrupted);

    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 148);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.failures, 2);

    let mut failed = fx.failures().await;
    failed.sort();
    assert_eq!(failed, vec!["oai:example.org:item007", "oai:example.org:item077"]);

    // The remote is unchanged, but failures are retried every cycle
    repo.set_broken("oai:example.org:item007", false);
    repo.set_broken("oai:example.org:item077", false);
    let report = fx.updater().run_cycle().await.unwrap();
    assert!(!report.polled);
    assert_eq!(report.retried, 2);
    assert_eq!(report.failed, 0);

    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 150);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn test_failure_count_grows_until_retries_run_out() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 3, &[]);
    repo.set_broken("oai:example.org:item001", true);
    let mut fx = fixture(repo.clone()).await;
    fx.config.updater.max_failed_retries = 2;

    for _ in 0..4 {
        fx.updater().run_cycle().await.unwrap();
    }

    let mut conn = fx.pool.acquire().await.unwrap();
    let failures = index::failures(&mut conn).await.unwrap();
    assert_eq!(failures.len(), 1);
    // One initial attempt plus two retries
    assert_eq!(failures[0].fail_count, 3);
    assert!(failures[0].last_fail_reason.contains("connection reset"));
    assert_eq!(index::queue_size(&mut conn).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reharvest_makes_old_content_prunable() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 5, &[]);
    let fx = fixture(repo.clone()).await;

    fx.updater().run_cycle().await.unwrap();
    let files_before = fx.store.all_paths().unwrap().len();

    repo.touch("oai_dc", base_date() + Duration::days(1));
    let report = fx.updater().run_cycle().await.unwrap();
    assert_eq!(report.queued, 5);
    assert!(report.pruned >= 5);

    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 5);
    assert_eq!(stats.prunables, 0);
    assert!(fx.store.all_paths().unwrap().len() <= files_before + 1);
}

#[tokio::test]
async fn test_missing_set_ancestors_are_added() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_set("a:b:c");
    repo.add_items("oai_dc", 3, &["a:b:c"]);
    let fx = fixture(repo.clone()).await;

    fx.updater().run_cycle().await.unwrap();

    let mut conn = fx.pool.acquire().await.unwrap();
    let mut specs = index::set_specs(&mut conn).await.unwrap();
    specs.sort();
    assert_eq!(specs, vec!["a", "a:b", "a:b:c"]);
    drop(conn);

    // Records are members of every ancestor of their declared set
    let responder = fx.responder();
    let part = responder
        .list_identifiers(&ListArgs {
            set: Some("a".to_string()),
            ..list_args("oai_dc")
        })
        .await
        .unwrap();
    assert_eq!(part.entries.len(), 3);
    assert_eq!(part.resumption, Resumption::None);

    let err = responder
        .list_identifiers(&ListArgs {
            set: Some("b".to_string()),
            ..list_args("oai_dc")
        })
        .await
        .unwrap_err();
    assert_eq!(code(&err), "noRecordsMatch");

    // Three sets with a page size of two
    let first = responder.list_sets(None).await.unwrap();
    assert_eq!(first.entries.len(), 2);
    let token = first.token().unwrap().to_string();
    let last = responder.list_sets(Some(&token)).await.unwrap();
    assert_eq!(last.entries.len(), 1);
    assert_eq!(last.resumption, Resumption::Final { cursor: 2 });
    responder.close().await;
}

#[tokio::test]
async fn test_record_in_unlisted_set_is_a_failure() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_set("physics");
    repo.add_items("oai_dc", 2, &["chemistry"]);
    let fx = fixture(repo.clone()).await;

    fx.updater().run_cycle().await.unwrap();

    let mut conn = fx.pool.acquire().await.unwrap();
    let failures = index::failures(&mut conn).await.unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures[0].last_fail_reason.contains("chemistry"));
    assert!(!index::item_exists(&mut conn, "oai:example.org:item000").await.unwrap());
}

#[tokio::test]
async fn test_removed_format_is_dropped() {
    let repo = MemoryRepository::new(&["oai_dc", "marc"]);
    repo.add_items("oai_dc", 10, &[]);
    repo.add_items("marc", 10, &[]);
    let fx = fixture(repo.clone()).await;

    fx.updater().run_cycle().await.unwrap();
    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.formats, 2);
    assert_eq!(stats.records, 20);

    repo.remove_format("marc");
    repo.touch("oai_dc", base_date() + Duration::days(2));
    fx.updater().run_cycle().await.unwrap();

    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.formats, 1);
    assert_eq!(stats.records, 10);

    let responder = fx.responder();
    let err = responder.list_records(&list_args("marc")).await.unwrap_err();
    assert_eq!(code(&err), "cannotDisseminateFormat");

    let err = responder
        .get_record("oai:example.org:item001", "marc")
        .await
        .unwrap_err();
    assert_eq!(code(&err), "cannotDisseminateFormat");

    let formats = responder
        .list_metadata_formats(Some("oai:example.org:item001"))
        .await
        .unwrap();
    assert_eq!(formats.len(), 1);
    assert_eq!(formats[0].prefix, "oai_dc");
    responder.close().await;
}

#[tokio::test]
async fn test_disabled_polling_skips_remote() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 5, &[]);
    let fx = fixture(repo.clone()).await;

    let mut conn = fx.pool.acquire().await.unwrap();
    index::set_polling_enabled(&mut conn, false).await.unwrap();
    drop(conn);

    let report = fx.updater().run_cycle().await.unwrap();
    assert!(!report.polled);
    assert_eq!(report.queued, 0);

    let responder = fx.responder();
    let err = responder.identify().await.unwrap_err();
    assert!(err.to_string().contains("not been polled"));
    responder.close().await;
}

struct RejectItem(&'static str);

impl RecordValidator for RejectItem {
    fn validate(&self, _prefix: &str, xml: &str) -> Result<()> {
        if xml.contains(self.0) {
            bail!("schema violation");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_custom_validator_rejects_record() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 5, &[]);
    let fx = fixture(repo.clone()).await;

    let updater = fx
        .updater()
        .with_validator(Some(Arc::new(RejectItem("oai:example.org:item003"))));
    let report = updater.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let mut conn = fx.pool.acquire().await.unwrap();
    let failures = index::failures(&mut conn).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].identifier, "oai:example.org:item003");
    assert!(failures[0].last_fail_reason.contains("schema violation"));
    drop(conn);

    // The rejected file never reaches the index or the store
    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 4);
    assert_eq!(stats.content_files, 5);
}

#[tokio::test]
async fn test_commit_error_rolls_back_and_next_cycle_recovers() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 30, &[]);
    let fx = fixture(repo.clone()).await;

    sqlx::query(
        "CREATE TRIGGER fail_records BEFORE INSERT ON records \
         BEGIN SELECT RAISE(ABORT, 'records are read-only'); END",
    )
    .execute(&fx.pool)
    .await
    .unwrap();

    let err = fx.updater().run_cycle().await.unwrap_err();
    assert!(format!("{err:#}").contains("Processing round aborted"), "{err:#}");

    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 0);
    assert_eq!(stats.queued, 30);
    assert_eq!(stats.failures, 0);
    // Fetched content of the aborted round is deleted; only identify remains
    assert_eq!(fx.store.all_paths().unwrap().len(), 1);

    sqlx::query("DROP TRIGGER fail_records")
        .execute(&fx.pool)
        .await
        .unwrap();
    fx.updater().run_cycle().await.unwrap();

    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 30);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.content_files, 31);
}

// ═══════════════════════════════════════════════════════════════════════
// Serving
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_get_record_uses_commit_datestamp() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 1, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    let responder = fx.responder();
    let content = responder
        .get_record("oai:example.org:item000", "oai_dc")
        .await
        .unwrap();
    let text = content.to_string_lossy().unwrap();
    assert!(text.contains("<identifier>oai:example.org:item000</identifier>"));
    // The remote datestamp is replaced by the time the record was committed
    assert!(!text.contains("2005-01-01T00:00:00Z"));

    let err = responder
        .get_record("oai:example.org:nothing", "oai_dc")
        .await
        .unwrap_err();
    assert_eq!(code(&err), "idDoesNotExist");

    let identify = responder.identify().await.unwrap();
    assert!(identify.to_string_lossy().unwrap().contains("memory"));
    responder.close().await;
}

#[tokio::test]
async fn test_paged_list_with_resumption_tokens() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 150, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    let responder = fx.responder();
    let mut part = responder.list_identifiers(&list_args("oai_dc")).await.unwrap();
    assert!(part.headers_only);
    assert_eq!(part.verb, "ListIdentifiers");

    let mut seen = part.entries.len();
    let mut cursors = Vec::new();
    while let Some(token) = part.token().map(str::to_string) {
        if let Resumption::Token { cursor, .. } = &part.resumption {
            cursors.push(*cursor);
        }

        let next = responder.list_identifiers(&token_args(&token)).await.unwrap();

        // Asking for the same part again returns the same entries
        let again = responder.list_identifiers(&token_args(&token)).await.unwrap();
        assert_eq!(again.entries, next.entries);

        seen += next.entries.len();
        part = next;
    }
    assert_eq!(seen, 150);
    assert_eq!(cursors, vec![0, 40, 80]);
    assert_eq!(part.resumption, Resumption::Final { cursor: 120 });
    assert_eq!(part.entries.len(), 30);

    let mut out = Vec::new();
    part.write_to(responder.cache().store(), &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("<ListIdentifiers>"));
    assert!(text.contains("<resumptionToken cursor=\"120\"/>"));
    responder.close().await;
}

#[tokio::test]
async fn test_out_of_order_and_stale_tokens() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 100, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    let responder = fx.responder();
    let first = responder.list_records(&list_args("oai_dc")).await.unwrap();
    let token = first.token().unwrap().to_string();
    let key = token.split('/').next().unwrap().to_string();

    // Skipping ahead is refused
    let err = responder
        .list_records(&token_args(&format!("{key}/2")))
        .await
        .unwrap_err();
    assert_eq!(code(&err), "badResumptionToken");
    assert!(protocol_error(&err).unwrap().message().contains("doesn't exist yet"));

    // A token of another verb is refused
    let err = responder.list_identifiers(&token_args(&token)).await.unwrap_err();
    assert_eq!(code(&err), "badResumptionToken");

    let second = responder.list_records(&token_args(&token)).await.unwrap();
    let third_token = second.token().unwrap().to_string();
    let third = responder.list_records(&token_args(&third_token)).await.unwrap();
    assert_eq!(third.entries.len(), 20);
    assert!(third.token().is_none());

    // Going back past the previous part is refused
    let err = responder.list_records(&token_args(&token)).await.unwrap_err();
    assert_eq!(code(&err), "badResumptionToken");

    // Nothing exists past the last part
    let err = responder
        .list_records(&token_args(&format!("{key}/3")))
        .await
        .unwrap_err();
    assert!(protocol_error(&err).unwrap().message().contains("does not exist"));
    responder.close().await;
}

#[tokio::test]
async fn test_bad_tokens_and_arguments() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 3, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    let responder = fx.responder();

    let err = responder.list_records(&token_args("garbage")).await.unwrap_err();
    assert_eq!(code(&err), "badResumptionToken");

    let err = responder
        .list_records(&token_args("0123456789abcdef/1"))
        .await
        .unwrap_err();
    assert!(protocol_error(&err).unwrap().message().contains("expired"));

    let err = responder
        .list_records(&ListArgs {
            resumption_token: Some("abc/1".to_string()),
            ..list_args("oai_dc")
        })
        .await
        .unwrap_err();
    assert_eq!(code(&err), "badArgument");

    let err = responder
        .list_records(&ListArgs {
            from: Some("2999-01-01".to_string()),
            ..list_args("oai_dc")
        })
        .await
        .unwrap_err();
    assert_eq!(code(&err), "noRecordsMatch");

    let err = responder
        .list_records(&ListArgs {
            set: Some("physics".to_string()),
            ..list_args("oai_dc")
        })
        .await
        .unwrap_err();
    assert_eq!(code(&err), "noSetHierarchy");

    let err = responder.list_sets(None).await.unwrap_err();
    assert_eq!(code(&err), "noSetHierarchy");
    responder.close().await;
}

#[tokio::test]
async fn test_single_part_list_leaves_no_session() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 5, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    let cache = RecordCache::new(fx.pool.clone(), fx.store.clone());
    let sessions = Arc::new(SessionManager::new(&fx.config.sessions).unwrap());
    let responder = Responder::new(cache, sessions.clone(), fx.config.responder.clone());

    let part = responder.list_records(&list_args("oai_dc")).await.unwrap();
    assert_eq!(part.entries.len(), 5);
    assert_eq!(part.resumption, Resumption::None);
    assert_eq!(sessions.session_count(), 0);

    let err = responder.list_records(&list_args("nope")).await.unwrap_err();
    assert_eq!(code(&err), "cannotDisseminateFormat");
    assert_eq!(sessions.session_count(), 0);
    responder.close().await;
}

#[tokio::test]
async fn test_open_sessions_do_not_hold_pool_connections() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 120, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    // More open lists than the pool has connections
    let responder = fx.responder();
    let mut tokens = Vec::new();
    for _ in 0..20 {
        let part = responder.list_records(&list_args("oai_dc")).await.unwrap();
        assert_eq!(part.entries.len(), 40);
        tokens.push(part.token().unwrap().to_string());
    }

    repo.touch("oai_dc", base_date() + Duration::days(30));
    let cycle = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        fx.updater().run_cycle(),
    )
    .await
    .expect("update cycle starved by open sessions");
    let report = cycle.unwrap();
    assert_eq!(report.queued, 120);

    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 120);
    assert_eq!(stats.queued, 0);

    // The sessions keep paging after the cycle
    for token in &tokens {
        let next = responder.list_records(&token_args(token)).await.unwrap();
        assert_eq!(next.entries.len(), 40);
    }
    responder.close().await;
}

#[tokio::test]
async fn test_session_expiry_needs_a_served_part() {
    use record_cache::provider::{ListProvider, RecordListProvider, RecordQuery};
    use std::time::Instant;

    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 100, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    let cache = RecordCache::new(fx.pool.clone(), fx.store.clone());
    let query = RecordQuery {
        prefix: "oai_dc".to_string(),
        ..Default::default()
    };
    let provider: Arc<dyn ListProvider> = Arc::new(RecordListProvider::records(cache, query, 40));
    let dir = fx.config.sessions.dir.join("lone");
    let session = record_cache::session::Session::start(
        "lone".to_string(),
        dir.clone(),
        provider,
        std::time::Duration::from_millis(20),
        std::time::Duration::from_secs(1),
    )
    .unwrap();

    // The producer may write the first part, but nothing was served yet
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let later = Instant::now() + std::time::Duration::from_secs(3600);
    assert!(!session.is_expired(later));

    let part = session.part(0).await.unwrap();
    assert_eq!(part.entries.len(), 40);
    assert!(!session.is_expired(Instant::now()));
    assert!(session.is_expired(Instant::now() + std::time::Duration::from_secs(2)));

    session.cleanup();
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_reaper_removes_expired_sessions() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 100, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    let config = SessionsConfig {
        seconds_between_requests: 0,
        ..fx.config.sessions.clone()
    };
    let cache = RecordCache::new(fx.pool.clone(), fx.store.clone());
    let sessions = Arc::new(SessionManager::new(&config).unwrap());
    let responder = Responder::new(cache, sessions.clone(), fx.config.responder.clone());

    let part = responder.list_records(&list_args("oai_dc")).await.unwrap();
    let token = part.token().unwrap().to_string();
    assert_eq!(sessions.session_count(), 1);
    assert_eq!(std::fs::read_dir(&config.dir).unwrap().count(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(sessions.reap_expired(), 1);
    assert_eq!(sessions.session_count(), 0);
    assert_eq!(std::fs::read_dir(&config.dir).unwrap().count(), 0);

    let err = responder.list_records(&token_args(&token)).await.unwrap_err();
    assert_eq!(code(&err), "badResumptionToken");
    assert!(err.to_string().contains("bad session id or session expired"));
    responder.close().await;
}

#[tokio::test]
async fn test_close_cleans_up_live_sessions() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 100, &[]);
    let fx = fixture(repo.clone()).await;
    fx.updater().run_cycle().await.unwrap();

    let cache = RecordCache::new(fx.pool.clone(), fx.store.clone());
    let sessions = Arc::new(SessionManager::new(&fx.config.sessions).unwrap());
    let responder = Responder::new(cache, sessions.clone(), fx.config.responder.clone());

    responder.list_records(&list_args("oai_dc")).await.unwrap();
    responder.list_identifiers(&list_args("oai_dc")).await.unwrap();
    assert_eq!(sessions.session_count(), 2);
    assert_eq!(sessions.reap_expired(), 0);

    // Let the producers write their read-ahead parts
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    sessions.close().await;
    assert_eq!(sessions.session_count(), 0);
    assert_eq!(std::fs::read_dir(&fx.config.sessions.dir).unwrap().count(), 0);
}

// ═══════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_spawned_updater_stops_gracefully_while_sleeping() {
    use record_cache::updater::UpdaterState;

    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 5, &[]);
    let fx = fixture(repo.clone()).await;

    let handle = fx.updater().spawn();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while handle.state() != UpdaterState::Sleeping {
        assert!(std::time::Instant::now() < deadline, "updater never went to sleep");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    handle.shutdown(false);
    handle.join().await.unwrap();

    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 5);
}

#[tokio::test]
async fn test_immediate_shutdown_before_first_cycle_commits_nothing() {
    let repo = MemoryRepository::new(&["oai_dc"]);
    repo.add_items("oai_dc", 5, &[]);
    let fx = fixture(repo.clone()).await;

    let handle = fx.updater().spawn();
    handle.shutdown(true);
    handle.join().await.unwrap();

    // The task first runs once the test awaits, so the cycle sees the
    // shutdown before doing any work
    let stats = collect_stats(&fx.pool, &fx.store, 0).await.unwrap();
    assert_eq!(stats.records, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.formats, 0);
}
