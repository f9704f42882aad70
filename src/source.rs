//! The contract a remote repository must satisfy to be harvested.
//!
//! The harvester only ever talks to a repository through [`RepositorySource`].
//! [`crate::source_fs::DirectorySource`] is the bundled implementation; a
//! network client plugs in the same way.
//!
//! # Example
//!
//! ```rust,ignore
//! use record_cache::source::{RemoteRecords, RepositorySource};
//!
//! struct MyRepository { /* ... */ }
//!
//! #[async_trait::async_trait]
//! impl RepositorySource for MyRepository {
//!     fn name(&self) -> &str { "my-repository" }
//!     // ...
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::io::Write;

use crate::models::{MetadataFormat, RemoteRecord, SetInfo};

/// A lazy sequence of changed records. Dropping it releases whatever the
/// source holds open.
pub type RemoteRecords = BoxStream<'static, Result<RemoteRecord>>;

#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &str;

    /// The most recent change anywhere in the repository.
    async fn latest_change(&self) -> Result<DateTime<Utc>>;

    async fn list_formats(&self) -> Result<Vec<MetadataFormat>>;

    async fn list_sets(&self) -> Result<Vec<SetInfo>>;

    /// Records of `prefix` changed after `from` (exclusive; `None` means from
    /// the beginning) and at or before `until`.
    ///
    /// A record's `source_info` must not contain a line break.
    async fn list_changed_records(
        &self,
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        prefix: &str,
    ) -> Result<RemoteRecords>;

    /// Write the XML of one record into `out`.
    async fn write_record_xml(
        &self,
        identifier: &str,
        prefix: &str,
        source_info: &str,
        out: &mut (dyn Write + Send),
    ) -> Result<()>;

    /// Write the repository's identify descriptor into `out`.
    async fn write_identify_xml(&self, out: &mut (dyn Write + Send)) -> Result<()>;
}
