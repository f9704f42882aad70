//! Time-bucketed file storage for cached XML payloads.
//!
//! Every file lives at `YYYY/MM/DD/HH/mm/ss.mmm.xml` relative to the store's
//! base directory, named after the instant it was allocated. Paths are
//! unique and sort lexicographically in creation order, which is what
//! [`ContentStore::cancel`] relies on.
//!
//! Allocation, cancellation and directory pruning all run under the
//! allocator lock, so a sweep never removes a directory that a concurrent
//! allocation is about to write into.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::models::SetInfo;

/// `strftime` pattern for content paths.
pub const PATH_FORMAT: &str = "%Y/%m/%d/%H/%M/%S%.3f.xml";

/// Length of the `YYYY/MM/DD/HH/mm` directory part of a content path.
const DIR_PREFIX_LEN: usize = 16;

/// Number of `/`-separated components in a content path.
const PATH_COMPONENTS: usize = 6;

/// Something that can serialize itself into the store.
pub trait Writable {
    fn write_xml(&self, out: &mut dyn Write) -> io::Result<()>;
}

impl Writable for str {
    fn write_xml(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self.as_bytes())
    }
}

impl Writable for String {
    fn write_xml(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self.as_bytes())
    }
}

impl Writable for SetInfo {
    fn write_xml(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self.xml.as_bytes())
    }
}

#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    base_dir: PathBuf,
    /// Epoch millis of the most recent allocation.
    last_allocated: Mutex<i64>,
}

impl ContentStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create content store at {}", base_dir.display()))?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                base_dir,
                last_allocated: Mutex::new(0),
            }),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    /// Absolute location of a relative content path.
    pub fn file(&self, path: &str) -> PathBuf {
        self.inner.base_dir.join(path)
    }

    /// Open a new file at a fresh, unique path.
    ///
    /// If the clock has not advanced past the previous allocation, this waits
    /// until it does.
    pub async fn allocate(&self) -> Result<ContentWriter> {
        let mut last = self.inner.last_allocated.lock().await;

        let mut now = Utc::now();
        while now.timestamp_millis() <= *last {
            tokio::time::sleep(Duration::from_millis(1)).await;
            now = Utc::now();
        }
        *last = now.timestamp_millis();

        let path = now.format(PATH_FORMAT).to_string();
        let dir = self.file(&path[..DIR_PREFIX_LEN]);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;

        let file_path = self.file(&path);
        let file = File::create(&file_path)
            .with_context(|| format!("Failed to create {}", file_path.display()))?;

        Ok(ContentWriter {
            path,
            file_path,
            out: BufWriter::new(file),
        })
    }

    /// Serialize `content` into a newly allocated file and return its path.
    pub async fn write<W: Writable + Sync + ?Sized>(&self, content: &W) -> Result<String> {
        let mut writer = self.allocate().await?;
        if let Err(e) = content.write_xml(&mut writer) {
            let path = writer.path().to_string();
            writer.discard();
            return Err(e).with_context(|| format!("Failed to write {}", path));
        }
        writer.finish()
    }

    /// A lazily streamed view of a cached file.
    ///
    /// With `datestamp`, the first `<datestamp>` element is rewritten to that
    /// value. With `header_only`, only the `<header>` element is produced.
    pub fn read(&self, path: &str, datestamp: Option<&str>, header_only: bool) -> CachedContent {
        CachedContent {
            file: self.file(path),
            datestamp: datestamp.map(str::to_string),
            header_only,
        }
    }

    /// Remove a single file. Returns false if it was already gone.
    pub fn delete(&self, path: &str) -> Result<bool> {
        let file = self.file(path);
        match fs::remove_file(&file) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", file.display())),
        }
    }

    /// Delete `path` and every file allocated after it, then prune the
    /// directories that leaves empty. Failures are logged, never returned.
    pub async fn cancel(&self, path: &str) {
        let components: Vec<&str> = path.split('/').collect();
        if components.len() != PATH_COMPONENTS || path.len() <= DIR_PREFIX_LEN {
            tracing::warn!(path, "cannot cancel from a malformed content path");
            return;
        }

        let _guard = self.inner.last_allocated.lock().await;
        let removed = cancel_within(&self.inner.base_dir, &components);
        tracing::debug!(path, removed, "cancelled content files");
        prune_children(&self.inner.base_dir);
    }

    /// Remove every empty directory under the base directory. Idempotent.
    pub async fn prune_empty_dirs(&self) -> usize {
        let _guard = self.inner.last_allocated.lock().await;
        prune_children(&self.inner.base_dir)
    }

    /// Every content path currently on disk, in creation order.
    pub fn all_paths(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.inner.base_dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.inner.base_dir)?;
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            paths.push(parts.join("/"));
        }
        Ok(paths)
    }
}

/// Delete files at or after the position described by `bound`, one path
/// component per directory level.
fn cancel_within(dir: &Path, bound: &[&str]) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot list directory during cancel");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_path = entry.path();
        let first = bound[0];

        if bound.len() == 1 {
            if entry_path.is_file() && name.as_str() >= first {
                removed += remove_logged(&entry_path);
            }
        } else if entry_path.is_dir() {
            if name.as_str() == first {
                removed += cancel_within(&entry_path, &bound[1..]);
            } else if name.as_str() > first {
                removed += remove_all_files(&entry_path);
            }
        }
    }
    removed
}

fn remove_all_files(dir: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if entry.file_type().is_file() {
            removed += remove_logged(entry.path());
        }
    }
    removed
}

fn remove_logged(file: &Path) -> usize {
    match fs::remove_file(file) {
        Ok(()) => 1,
        Err(e) => {
            tracing::warn!(file = %file.display(), error = %e, "failed to delete content file");
            0
        }
    }
}

/// Prune empty directories below `dir` (but never `dir` itself).
fn prune_children(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            removed += prune_children(&path);
            let is_empty = fs::read_dir(&path)
                .map(|mut rd| rd.next().is_none())
                .unwrap_or(false);
            if is_empty {
                match fs::remove_dir(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(dir = %path.display(), error = %e, "failed to prune directory")
                    }
                }
            }
        }
    }
    removed
}

/// An open content file that has not been finished yet.
pub struct ContentWriter {
    path: String,
    file_path: PathBuf,
    out: BufWriter<File>,
}

impl ContentWriter {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Flush and close the file, returning its relative path.
    pub fn finish(self) -> Result<String> {
        let ContentWriter {
            path,
            file_path,
            mut out,
        } = self;
        out.flush()
            .with_context(|| format!("Failed to flush {}", file_path.display()))?;
        Ok(path)
    }

    /// Close and delete the partially written file.
    pub fn discard(self) {
        let ContentWriter { file_path, out, .. } = self;
        drop(out);
        if let Err(e) = fs::remove_file(&file_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(file = %file_path.display(), error = %e, "failed to discard content file");
            }
        }
    }
}

impl Write for ContentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// A cached file, read only when written out.
#[derive(Debug, Clone)]
pub struct CachedContent {
    file: PathBuf,
    datestamp: Option<String>,
    header_only: bool,
}

impl CachedContent {
    pub fn write_to(&self, out: &mut dyn Write) -> Result<()> {
        let file = File::open(&self.file)
            .with_context(|| format!("Failed to open cached content {}", self.file.display()))?;
        let mut reader = BufReader::new(file);

        if self.datestamp.is_none() && !self.header_only {
            io::copy(&mut reader, out)?;
            return Ok(());
        }

        let mut head = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            head.push_str(&line);
            if line.contains("</header>") {
                break;
            }
        }

        if let Some(datestamp) = &self.datestamp {
            head = rewrite_datestamp(&head, datestamp);
        }

        if self.header_only {
            let start = head.find("<header");
            let end = head.find("</header>");
            match (start, end) {
                (Some(start), Some(end)) if start < end => {
                    out.write_all(head[start..end + "</header>".len()].as_bytes())?;
                }
                _ => anyhow::bail!("No header element in {}", self.file.display()),
            }
            return Ok(());
        }

        out.write_all(head.as_bytes())?;
        io::copy(&mut reader, out)?;
        Ok(())
    }

    pub fn to_string_lossy(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Replace the value of the first `<datestamp>` element in `xml`.
fn rewrite_datestamp(xml: &str, datestamp: &str) -> String {
    const OPEN: &str = "<datestamp>";
    const CLOSE: &str = "</datestamp>";
    let Some(open) = xml.find(OPEN) else {
        return xml.to_string();
    };
    let value_start = open + OPEN.len();
    let Some(close) = xml[value_start..].find(CLOSE) else {
        return xml.to_string();
    };
    let mut rewritten = String::with_capacity(xml.len());
    rewritten.push_str(&xml[..value_start]);
    rewritten.push_str(datestamp);
    rewritten.push_str(&xml[value_start + close..]);
    rewritten
}
