//! A repository laid out as plain files in a directory.
//!
//! ```text
//! <dir>/
//!   identity.xml
//!   formats/oai_dc.txt            line 1: namespace URI, line 2: schema location
//!   sets/physics-quantum.xml      descriptor of set "physics:quantum"
//!   records/item1-oai_dc-2005-01-01T08-50-44.xml
//! ```
//!
//! A record file's name carries its item, its metadata prefix and its last
//! modification time. The item may contain `-`; the prefix may not.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::SourceConfig;
use crate::models::{MetadataFormat, RemoteRecord, SetInfo};
use crate::source::{RemoteRecords, RepositorySource};

const IDENTITY_FILENAME: &str = "identity.xml";
const RECORDS_DIRNAME: &str = "records";
const SETS_DIRNAME: &str = "sets";
const FORMATS_DIRNAME: &str = "formats";

/// Date format embedded in record file names.
const RECORD_DATE_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
/// Length of a date formatted with [`RECORD_DATE_FORMAT`].
const RECORD_DATE_LEN: usize = 19;

pub struct DirectorySource {
    root: PathBuf,
    identifier_prefix: String,
}

/// A parsed record file name.
#[derive(Debug, PartialEq, Eq)]
struct RecordFile {
    item: String,
    prefix: String,
    modified: DateTime<Utc>,
}

impl DirectorySource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let root = config.dir.clone();
        if !root.is_dir() {
            bail!("Source directory does not exist: {}", root.display());
        }
        for required in [IDENTITY_FILENAME, RECORDS_DIRNAME, SETS_DIRNAME, FORMATS_DIRNAME] {
            let path = root.join(required);
            if !path.exists() {
                bail!("Source is missing {}", path.display());
            }
        }
        Ok(Self {
            root,
            identifier_prefix: config.identifier_prefix.clone(),
        })
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// All parsable record files, sorted by file name.
    fn record_files(&self) -> Result<Vec<(PathBuf, RecordFile)>> {
        let mut files = Vec::new();
        for entry in read_dir_sorted(&self.dir(RECORDS_DIRNAME))? {
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match parse_record_filename(&name) {
                Some(record) => files.push((entry, record)),
                None => tracing::warn!(file = %name, "ignoring unparsable record file name"),
            }
        }
        Ok(files)
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

/// `item1-oai_dc-2005-01-01T08-50-44.xml` → (item1, oai_dc, 2005-01-01T08:50:44Z).
/// The date is taken from the end of the name, then the prefix.
fn parse_record_filename(name: &str) -> Option<RecordFile> {
    let stem = name.strip_suffix(".xml")?;
    let split = stem.len().checked_sub(RECORD_DATE_LEN + 1)?;
    let rest = stem.get(..split)?;
    let date = stem.get(split..)?.strip_prefix('-')?;
    let (item, prefix) = rest.rsplit_once('-')?;
    if item.is_empty() || prefix.is_empty() {
        return None;
    }
    let modified = NaiveDateTime::parse_from_str(date, RECORD_DATE_FORMAT)
        .ok()?
        .and_utc();
    Some(RecordFile {
        item: item.to_string(),
        prefix: prefix.to_string(),
        modified,
    })
}

fn copy_file(file: &Path, out: &mut (dyn Write + Send)) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Error reading from file: {}", file.display()))?;
    out.write_all(&bytes)?;
    Ok(())
}

#[async_trait]
impl RepositorySource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    async fn latest_change(&self) -> Result<DateTime<Utc>> {
        Ok(self
            .record_files()?
            .into_iter()
            .map(|(_, r)| r.modified)
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    async fn list_formats(&self) -> Result<Vec<MetadataFormat>> {
        let mut formats = Vec::new();
        for path in read_dir_sorted(&self.dir(FORMATS_DIRNAME))? {
            let Some(prefix) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".txt"))
            else {
                continue;
            };
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read format file {}", path.display()))?;
            let mut lines = content.lines();
            let (Some(uri), Some(loc)) = (lines.next(), lines.next()) else {
                bail!("Format file needs two lines: {}", path.display());
            };
            formats.push(MetadataFormat {
                prefix: prefix.to_string(),
                namespace_uri: uri.trim().to_string(),
                schema_location: loc.trim().to_string(),
            });
        }
        Ok(formats)
    }

    async fn list_sets(&self) -> Result<Vec<SetInfo>> {
        let mut sets = Vec::new();
        for path in read_dir_sorted(&self.dir(SETS_DIRNAME))? {
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".xml"))
            else {
                continue;
            };
            let xml = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read set file {}", path.display()))?;
            sets.push(SetInfo {
                spec: stem.replace('-', ":"),
                xml,
            });
        }
        Ok(sets)
    }

    async fn list_changed_records(
        &self,
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        prefix: &str,
    ) -> Result<RemoteRecords> {
        let mut records = Vec::new();
        for (path, file) in self.record_files()? {
            if file.prefix != prefix {
                continue;
            }
            let after_from = from.map_or(true, |f| file.modified > f);
            if after_from && file.modified <= until {
                records.push(Ok(RemoteRecord {
                    identifier: format!("{}{}", self.identifier_prefix, file.item),
                    prefix: file.prefix,
                    source_info: path.to_string_lossy().into_owned(),
                }));
            }
        }
        Ok(Box::pin(futures::stream::iter(records)))
    }

    async fn write_record_xml(
        &self,
        _identifier: &str,
        _prefix: &str,
        source_info: &str,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        copy_file(Path::new(source_info), out)
    }

    async fn write_identify_xml(&self, out: &mut (dyn Write + Send)) -> Result<()> {
        copy_file(&self.root.join(IDENTITY_FILENAME), out)
    }
}
