//! One paginated list, materialized part by part into files.
//!
//! A [`Session`] owns a background producer that pulls entries from a
//! [`ListProvider`] and writes them to numbered part files in the session's
//! directory. The producer stays at most one part ahead of the last part a
//! client asked for. Each part file holds one `<path> [<datestamp>]` line per
//! entry followed by a trailer line:
//!
//! ```text
//! end <token> <cursor>    more parts follow
//! end <cursor>            last part of a multi-part list
//! end                     the whole list fit in one part
//! ```
//!
//! `<cursor>` counts the entries of every part before this one.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;
use crate::index::PathEntry;
use crate::provider::ListProvider;
use crate::store::ContentStore;

const PART_TRAILER: &str = "end";

/// What the client is told after the entries of a part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumption {
    /// The list is complete in this single part.
    None,
    /// More parts follow.
    Token { token: String, cursor: usize },
    /// Last part of a multi-part list.
    Final { cursor: usize },
}

/// One served part of a list response.
#[derive(Debug, Clone)]
pub struct ResponsePart {
    pub verb: &'static str,
    pub headers_only: bool,
    pub entries: Vec<PathEntry>,
    pub resumption: Resumption,
}

impl ResponsePart {
    /// Token for the next part, if there is one.
    pub fn token(&self) -> Option<&str> {
        match &self.resumption {
            Resumption::Token { token, .. } => Some(token),
            _ => None,
        }
    }

    /// Render the part, reading each entry's content from `store`.
    pub fn write_to(&self, store: &ContentStore, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "<{}>", self.verb)?;
        for entry in &self.entries {
            store
                .read(&entry.path, entry.datestamp.as_deref(), self.headers_only)
                .write_to(out)?;
            writeln!(out)?;
        }
        match &self.resumption {
            Resumption::None => {}
            Resumption::Token { token, cursor } => {
                writeln!(out, "<resumptionToken cursor=\"{cursor}\">{token}</resumptionToken>")?
            }
            Resumption::Final { cursor } => writeln!(out, "<resumptionToken cursor=\"{cursor}\"/>")?,
        }
        writeln!(out, "</{}>", self.verb)?;
        Ok(())
    }
}

/// A failure captured by the producer, replayed on every later request.
#[derive(Debug, Clone)]
enum CapturedError {
    Protocol(ProtocolError),
    Internal(String),
}

impl CapturedError {
    fn capture(err: &anyhow::Error) -> Self {
        match crate::error::protocol_error(err) {
            Some(protocol) => CapturedError::Protocol(protocol.clone()),
            None => CapturedError::Internal(format!("{err:#}")),
        }
    }

    fn to_error(&self) -> anyhow::Error {
        match self {
            CapturedError::Protocol(protocol) => protocol.clone().into(),
            CapturedError::Internal(message) => anyhow!("{message}"),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    /// Part files fully written so far.
    parts_written: usize,
    /// The producer has written the last part.
    finished: bool,
    error: Option<CapturedError>,
    last_sent: Option<usize>,
    last_sent_at: Option<Instant>,
}

pub struct Session {
    key: String,
    dir: PathBuf,
    verb: &'static str,
    headers_only: bool,
    state: Mutex<SessionState>,
    /// Signalled by the producer when a part is written or it fails.
    progress: Notify,
    /// Signalled when a part is served, letting the producer move ahead.
    demand: Notify,
    stop: CancellationToken,
    poll: Duration,
    between_requests: Duration,
}

impl Session {
    /// Create the session directory and start the producer.
    pub fn start(
        key: String,
        dir: PathBuf,
        provider: Arc<dyn ListProvider>,
        poll: Duration,
        between_requests: Duration,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session directory {}", dir.display()))?;

        let session = Arc::new(Self {
            key,
            dir,
            verb: provider.verb(),
            headers_only: provider.headers_only(),
            state: Mutex::new(SessionState::default()),
            progress: Notify::new(),
            demand: Notify::new(),
            stop: CancellationToken::new(),
            poll,
            between_requests,
        });

        let producer = session.clone();
        tokio::spawn(async move { producer.produce(provider).await });
        Ok(session)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn verb(&self) -> &'static str {
        self.verb
    }

    fn state(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("session {} state lock poisoned", self.key))
    }

    fn part_file(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{n}.txt"))
    }

    fn token_for(&self, n: usize) -> String {
        format!("{}/{}", self.key, n)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Serving
    // ═══════════════════════════════════════════════════════════════════

    /// Serve part `n`, waiting for the producer if it has not written it yet.
    ///
    /// Only the last served part or the one after it may be requested.
    pub async fn part(&self, n: usize) -> Result<ResponsePart> {
        loop {
            let progress = self.progress.notified();
            tokio::pin!(progress);
            progress.as_mut().enable();

            if let Some(part) = self.try_serve(n)? {
                return Ok(part);
            }
            if self.stop.is_cancelled() {
                bail!(ProtocolError::bad_token("bad session id or session expired"));
            }
            let _ = tokio::time::timeout(self.poll, progress).await;
        }
    }

    fn try_serve(&self, n: usize) -> Result<Option<ResponsePart>> {
        let mut state = self.state()?;

        if let Some(err) = &state.error {
            return Err(err.to_error());
        }
        if state.finished && n >= state.parts_written {
            bail!(ProtocolError::bad_token("the indicated part does not exist"));
        }
        let in_order = match state.last_sent {
            None => n == 0,
            Some(last) => n == last || n == last + 1,
        };
        if !in_order {
            bail!(ProtocolError::bad_token(
                "the indicated part either doesn't exist yet or has expired"
            ));
        }
        if n >= state.parts_written {
            return Ok(None);
        }

        let part = self.read_part(n)?;

        if let Some(previous) = state.last_sent.filter(|&last| last < n) {
            remove_part_file(&self.part_file(previous));
        }
        state.last_sent = Some(n);
        state.last_sent_at = Some(Instant::now());
        drop(state);

        self.demand.notify_one();
        Ok(Some(part))
    }

    fn read_part(&self, n: usize) -> Result<ResponsePart> {
        let file = self.part_file(n);
        let content = fs::read_to_string(&file)
            .with_context(|| format!("Failed to read session part {}", file.display()))?;

        let mut entries = Vec::new();
        let mut resumption = None;
        for line in content.lines() {
            if let Some(trailer) = line.strip_prefix(PART_TRAILER) {
                resumption = Some(parse_trailer(trailer.trim())?);
                break;
            }
            let (path, datestamp) = match line.split_once(' ') {
                Some((path, datestamp)) => (path, Some(datestamp.to_string())),
                None => (line, None),
            };
            entries.push(PathEntry {
                path: path.to_string(),
                datestamp,
            });
        }

        let Some(resumption) = resumption else {
            bail!("Session part {} has no trailer", file.display());
        };
        Ok(ResponsePart {
            verb: self.verb,
            headers_only: self.headers_only,
            entries,
            resumption,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Producing
    // ═══════════════════════════════════════════════════════════════════

    async fn produce(self: Arc<Self>, provider: Arc<dyn ListProvider>) {
        let result = self.produce_parts(provider.as_ref()).await;

        if let Ok(mut state) = self.state.lock() {
            match result {
                Ok(()) => state.finished = true,
                Err(e) => {
                    let captured = CapturedError::capture(&e);
                    if let CapturedError::Internal(message) = &captured {
                        tracing::error!(session = %self.key, error = %message, "session producer failed");
                    }
                    state.error = Some(captured);
                }
            }
        }
        self.progress.notify_waiters();
    }

    async fn produce_parts(&self, provider: &dyn ListProvider) -> Result<()> {
        let mut cursor = provider.open().await?;
        let page_size = provider.page_size().max(1);
        let mut part = 0;
        let mut offset = 0;

        loop {
            if !self.wait_for_demand(part).await {
                cursor.close().await?;
                return Ok(());
            }

            let mut entries = Vec::with_capacity(page_size);
            while entries.len() < page_size {
                match cursor.next().await? {
                    Some(entry) => entries.push(entry),
                    None => break,
                }
            }
            let more = cursor.peek().await?.is_some();

            if part == 0 && entries.is_empty() {
                cursor.close().await?;
                return Err(provider.diagnose_empty().await?.into());
            }

            let resumption = if more {
                Resumption::Token {
                    token: self.token_for(part + 1),
                    cursor: offset,
                }
            } else if part == 0 {
                Resumption::None
            } else {
                Resumption::Final { cursor: offset }
            };
            self.write_part(part, &entries, &resumption)?;
            offset += entries.len();

            {
                let mut state = self.state()?;
                state.parts_written = part + 1;
                state.finished = !more;
            }
            self.progress.notify_waiters();

            if !more {
                cursor.close().await?;
                return Ok(());
            }
            part += 1;
        }
    }

    /// Wait until part `n` may be produced. Returns false once stopped.
    async fn wait_for_demand(&self, n: usize) -> bool {
        loop {
            let demand = self.demand.notified();
            tokio::pin!(demand);
            demand.as_mut().enable();

            if self.stop.is_cancelled() {
                return false;
            }
            let allowed = match self.state() {
                Ok(state) => n <= state.last_sent.map_or(0, |last| last + 1),
                Err(_) => return false,
            };
            if allowed {
                return true;
            }

            tokio::select! {
                _ = self.stop.cancelled() => return false,
                _ = tokio::time::timeout(self.poll, demand) => {}
            }
        }
    }

    fn write_part(&self, n: usize, entries: &[PathEntry], resumption: &Resumption) -> Result<()> {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&entry.path);
            if let Some(datestamp) = &entry.datestamp {
                content.push(' ');
                content.push_str(datestamp);
            }
            content.push('\n');
        }
        match resumption {
            Resumption::None => content.push_str(PART_TRAILER),
            Resumption::Token { token, cursor } => {
                content.push_str(&format!("{PART_TRAILER} {token} {cursor}"))
            }
            Resumption::Final { cursor } => content.push_str(&format!("{PART_TRAILER} {cursor}")),
        }
        content.push('\n');

        let file = self.part_file(n);
        let tmp = file.with_extension("tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &file).with_context(|| format!("Failed to finish {}", file.display()))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Lifetime
    // ═══════════════════════════════════════════════════════════════════

    /// True once a part was produced and served, and no request has come in
    /// for longer than the inter-request budget.
    pub fn is_expired(&self, now: Instant) -> bool {
        let Ok(state) = self.state.lock() else {
            return true;
        };
        if state.parts_written == 0 && state.error.is_none() {
            return false;
        }
        match state.last_sent_at {
            Some(at) => now.saturating_duration_since(at) > self.between_requests,
            None => false,
        }
    }

    /// Stop the producer and delete every remaining part file.
    pub fn cleanup(&self) {
        self.stop.cancel();
        self.demand.notify_waiters();
        self.progress.notify_waiters();
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session = %self.key, dir = %self.dir.display(), error = %e, "failed to remove session directory");
            }
        }
    }
}

fn parse_trailer(trailer: &str) -> Result<Resumption> {
    let fields: Vec<&str> = trailer.split_whitespace().collect();
    match fields.as_slice() {
        [] => Ok(Resumption::None),
        [cursor] => Ok(Resumption::Final {
            cursor: cursor.parse().context("Bad cursor in session part")?,
        }),
        [token, cursor] => Ok(Resumption::Token {
            token: token.to_string(),
            cursor: cursor.parse().context("Bad cursor in session part")?,
        }),
        _ => bail!("Malformed session part trailer: {:?}", trailer),
    }
}

fn remove_part_file(file: &Path) {
    if let Err(e) = fs::remove_file(file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(file = %file.display(), error = %e, "failed to delete served part");
        }
    }
}
