//! TOML configuration for the cache, the harvester and the session layer.
//!
//! Every section except `[db]` and `[cache]` may be omitted; missing keys
//! fall back to the `default_*` functions below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub source: Option<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Location of the on-disk Content Store.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_sessions_dir")]
    pub dir: PathBuf,
    /// Inactivity budget between two requests of the same paginated list.
    #[serde(default = "default_seconds_between_requests")]
    pub seconds_between_requests: u64,
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// Upper bound on a single wait for a part that is still being written.
    #[serde(default = "default_session_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: default_sessions_dir(),
            seconds_between_requests: default_seconds_between_requests(),
            reap_interval_ms: default_reap_interval_ms(),
            poll_interval_ms: default_session_poll_ms(),
        }
    }
}

impl SessionsConfig {
    pub fn between_requests(&self) -> Duration {
        Duration::from_secs(self.seconds_between_requests)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("./data/sessions")
}
fn default_seconds_between_requests() -> u64 {
    600
}
fn default_reap_interval_ms() -> u64 {
    5000
}
fn default_session_poll_ms() -> u64 {
    250
}

/// Page sizes for the paginated list verbs.
#[derive(Debug, Deserialize, Clone)]
pub struct ResponderConfig {
    #[serde(default = "default_record_list_size")]
    pub incomplete_record_list_size: usize,
    #[serde(default = "default_identifier_list_size")]
    pub incomplete_identifier_list_size: usize,
    #[serde(default = "default_set_list_size")]
    pub incomplete_set_list_size: usize,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            incomplete_record_list_size: default_record_list_size(),
            incomplete_identifier_list_size: default_identifier_list_size(),
            incomplete_set_list_size: default_set_list_size(),
        }
    }
}

fn default_record_list_size() -> usize {
    250
}
fn default_identifier_list_size() -> usize {
    500
}
fn default_set_list_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpdaterConfig {
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_work_batch_size")]
    pub max_work_batch_size: usize,
    /// Failed records are re-queued while their attempt count is at most this.
    /// Zero disables retries.
    #[serde(default = "default_max_failed_retries")]
    pub max_failed_retries: i64,
    #[serde(default = "default_max_commit_queue_size")]
    pub max_commit_queue_size: usize,
    #[serde(default = "default_max_records_per_transaction")]
    pub max_records_per_transaction: usize,
    /// How far into the future freshly committed records are stamped.
    #[serde(default = "default_commit_date_margin_ms")]
    pub commit_date_margin_ms: i64,
    #[serde(default = "default_validate_records")]
    pub validate_records: bool,
    #[serde(default = "default_handoff_poll_ms")]
    pub handoff_poll_ms: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            poll_seconds: default_poll_seconds(),
            max_workers: default_max_workers(),
            max_work_batch_size: default_max_work_batch_size(),
            max_failed_retries: default_max_failed_retries(),
            max_commit_queue_size: default_max_commit_queue_size(),
            max_records_per_transaction: default_max_records_per_transaction(),
            commit_date_margin_ms: default_commit_date_margin_ms(),
            validate_records: default_validate_records(),
            handoff_poll_ms: default_handoff_poll_ms(),
        }
    }
}

impl UpdaterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds)
    }

    pub fn handoff_poll(&self) -> Duration {
        Duration::from_millis(self.handoff_poll_ms)
    }
}

fn default_poll_seconds() -> u64 {
    120
}
fn default_max_workers() -> usize {
    5
}
fn default_max_work_batch_size() -> usize {
    10
}
fn default_max_failed_retries() -> i64 {
    5
}
fn default_max_commit_queue_size() -> usize {
    120
}
fn default_max_records_per_transaction() -> usize {
    60
}
fn default_commit_date_margin_ms() -> i64 {
    5000
}
fn default_validate_records() -> bool {
    true
}
fn default_handoff_poll_ms() -> u64 {
    100
}

/// A repository laid out on the local filesystem (see [`crate::source_fs`]).
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub dir: PathBuf,
    #[serde(default = "default_identifier_prefix")]
    pub identifier_prefix: String,
}

fn default_identifier_prefix() -> String {
    "oai:example.org:".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let updater = &config.updater;
    if updater.poll_seconds == 0 {
        anyhow::bail!("updater.poll_seconds must be > 0");
    }
    if updater.max_workers == 0 {
        anyhow::bail!("updater.max_workers must be > 0");
    }
    if updater.max_work_batch_size == 0 {
        anyhow::bail!("updater.max_work_batch_size must be > 0");
    }
    if updater.max_records_per_transaction == 0 {
        anyhow::bail!("updater.max_records_per_transaction must be > 0");
    }
    if updater.max_commit_queue_size < updater.max_work_batch_size {
        anyhow::bail!(
            "updater.max_commit_queue_size ({}) must be >= updater.max_work_batch_size ({})",
            updater.max_commit_queue_size,
            updater.max_work_batch_size
        );
    }
    if updater.max_failed_retries < 0 {
        anyhow::bail!("updater.max_failed_retries must be >= 0");
    }
    if updater.commit_date_margin_ms < 0 {
        anyhow::bail!("updater.commit_date_margin_ms must be >= 0");
    }

    let responder = &config.responder;
    if responder.incomplete_record_list_size == 0
        || responder.incomplete_identifier_list_size == 0
        || responder.incomplete_set_list_size == 0
    {
        anyhow::bail!("responder list sizes must be > 0");
    }

    if config.sessions.poll_interval_ms == 0 || config.sessions.reap_interval_ms == 0 {
        anyhow::bail!("sessions.poll_interval_ms and sessions.reap_interval_ms must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(
            r#"
            [db]
            path = "/tmp/cache.sqlite"

            [cache]
            dir = "/tmp/records"
            "#,
        )
        .unwrap();

        assert_eq!(config.updater.max_workers, 5);
        assert_eq!(config.updater.commit_date_margin_ms, 5000);
        assert_eq!(config.sessions.seconds_between_requests, 600);
        assert_eq!(config.responder.incomplete_record_list_size, 250);
        assert!(config.source.is_none());
    }

    #[test]
    fn test_commit_queue_smaller_than_batch_is_rejected() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/cache.sqlite"

            [cache]
            dir = "/tmp/records"

            [updater]
            max_work_batch_size = 50
            max_commit_queue_size = 10
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("max_commit_queue_size"));
    }

    #[test]
    fn test_source_section() {
        let config = parse(
            r#"
            [db]
            path = "/tmp/cache.sqlite"

            [cache]
            dir = "/tmp/records"

            [source]
            dir = "/srv/repo"
            "#,
        )
        .unwrap();

        let source = config.source.unwrap();
        assert_eq!(source.dir, PathBuf::from("/srv/repo"));
        assert_eq!(source.identifier_prefix, "oai:example.org:");
    }
}
