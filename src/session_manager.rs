//! Registry of live list sessions, keyed by the opaque id embedded in
//! resumption tokens, plus the reaper that expires abandoned sessions.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionsConfig;
use crate::error::ProtocolError;
use crate::provider::ListProvider;
use crate::session::{ResponsePart, Session};

pub struct SessionManager {
    inner: Arc<Registry>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

struct Registry {
    base_dir: PathBuf,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    between_requests: Duration,
    poll: Duration,
    shutdown: CancellationToken,
}

impl Registry {
    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<Session>>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session registry lock poisoned"))
    }

    fn remove(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions().ok().and_then(|mut s| s.remove(key))
    }

    /// Clean up and drop every expired session. Returns how many were reaped.
    fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = match self.sessions() {
            Ok(mut sessions) => {
                let keys: Vec<String> = sessions
                    .iter()
                    .filter(|(_, s)| s.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect();
                keys.iter().filter_map(|k| sessions.remove(k)).collect()
            }
            Err(_) => Vec::new(),
        };

        for session in &expired {
            tracing::debug!(session = %session.key(), "reaping expired session");
            session.cleanup();
        }
        expired.len()
    }
}

impl SessionManager {
    /// Open the manager, clearing anything a previous process left in the
    /// session directory, and start the reaper.
    pub fn new(config: &SessionsConfig) -> Result<Self> {
        let base_dir = config.dir.clone();
        if base_dir.exists() {
            fs::remove_dir_all(&base_dir).with_context(|| {
                format!("Failed to clear session directory {}", base_dir.display())
            })?;
        }
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create session directory {}", base_dir.display()))?;

        let inner = Arc::new(Registry {
            base_dir,
            sessions: Mutex::new(HashMap::new()),
            between_requests: config.between_requests(),
            poll: config.poll_interval(),
            shutdown: CancellationToken::new(),
        });

        let reaper = tokio::spawn(reap_loop(inner.clone(), config.reap_interval()));
        Ok(Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Start a session for `provider` and return its first part.
    ///
    /// If the first part cannot be produced the session is discarded and the
    /// reason returned.
    pub async fn list(&self, provider: Arc<dyn ListProvider>) -> Result<ResponsePart> {
        if self.inner.shutdown.is_cancelled() {
            bail!("session manager is shut down");
        }

        let key = uuid::Uuid::new_v4().simple().to_string();
        let session = Session::start(
            key.clone(),
            self.inner.base_dir.join(&key),
            provider,
            self.inner.poll,
            self.inner.between_requests,
        )?;
        self.inner.sessions()?.insert(key.clone(), session.clone());

        match session.part(0).await {
            Ok(part) => {
                if part.token().is_none() {
                    // Single-part lists need no session afterwards
                    self.inner.remove(&key);
                    session.cleanup();
                }
                Ok(part)
            }
            Err(e) => {
                self.inner.remove(&key);
                session.cleanup();
                Err(e)
            }
        }
    }

    /// Serve the part a resumption token refers to, provided the token was
    /// issued for `verb`.
    pub async fn resolve(&self, token: &str, verb: &str) -> Result<ResponsePart> {
        let (key, part) = parse_token(token)?;
        let session = self
            .inner
            .sessions()?
            .get(key)
            .cloned()
            .ok_or_else(|| ProtocolError::bad_token("bad session id or session expired"))?;
        if session.verb() != verb {
            bail!(ProtocolError::bad_token("the resumption token belongs to another verb"));
        }
        session.part(part).await
    }

    pub fn reap_expired(&self) -> usize {
        self.inner.reap_expired()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions().map(|s| s.len()).unwrap_or(0)
    }

    /// Stop the reaper and clean up every session, expired or not.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let reaper = self.reaper.lock().ok().and_then(|mut r| r.take());
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                tracing::warn!(error = %e, "session reaper ended abnormally");
            }
        }

        let all: Vec<Arc<Session>> = match self.inner.sessions() {
            Ok(mut sessions) => sessions.drain().map(|(_, s)| s).collect(),
            Err(_) => Vec::new(),
        };
        for session in &all {
            session.cleanup();
        }
        tracing::debug!(sessions = all.len(), "session manager closed");
    }
}

async fn reap_loop(registry: Arc<Registry>, interval: Duration) {
    loop {
        tokio::select! {
            _ = registry.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let reaped = registry.reap_expired();
                if reaped > 0 {
                    tracing::info!(reaped, "expired list sessions");
                }
            }
        }
    }
}

/// Split `<session>/<part>`.
fn parse_token(token: &str) -> Result<(&str, usize)> {
    let parts: Vec<&str> = token.split('/').collect();
    let [key, part] = parts.as_slice() else {
        bail!(ProtocolError::bad_token(
            "bad syntax in resumption token: must contain exactly one slash"
        ));
    };
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        bail!(ProtocolError::bad_token(
            "bad syntax in resumption token: expected an integer after the slash"
        ));
    }
    let Ok(part) = part.parse::<usize>() else {
        bail!(ProtocolError::bad_token(
            "bad syntax in resumption token: expected an integer after the slash"
        ));
    };
    Ok((*key, part))
}
