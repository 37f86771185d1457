//! Filesystem session store
//!
//! Layout per session under the store root:
//!
//! ```text
//! <root>/<session-id>/
//!   header.json         # id, timestamps, turn_count, token_total, policy
//!   messages.log        # one JSON entry per line
//!   events.ring         # bounded event history
//!   status.json         # supervisor snapshot (written by the supervisor)
//!   session.id          # session-id sidecar
//!   call_count          # rate-bucket state
//!   iterations/         # one file per autonomous iteration
//!   checkpoints/<name>/ # named immutable snapshots
//! ```
//!
//! Every mutable file is written temp-then-rename so readers observe either
//! the full prior state or the full new state.

use crate::context::{ContextConfig, ContextLog, Entry};
use crate::session::{Session, SessionHeader};
use autoloop_core::{EngineEvent, Error, Result, SessionId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

const HEADER_FILE: &str = "header.json";
const MESSAGES_FILE: &str = "messages.log";
const EVENTS_FILE: &str = "events.ring";
const SESSION_ID_FILE: &str = "session.id";
const CHECKPOINTS_DIR: &str = "checkpoints";
const ITERATIONS_DIR: &str = "iterations";

/// Summary row for `list`.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub id: SessionId,
    pub header: SessionHeader,
    pub expired: bool,
}

/// A loaded session plus its expiry verdict. Expired sessions are readable
/// but must not be continued.
pub struct LoadedSession {
    pub session: Arc<Session>,
    pub expired: bool,
}

pub struct FsSessionStore {
    root: PathBuf,
}

impl FsSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn iterations_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(ITERATIONS_DIR)
    }

    /// Create the session directory skeleton and write the initial snapshot.
    pub async fn create(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(dir.join(ITERATIONS_DIR)).await?;
        fs::create_dir_all(dir.join(CHECKPOINTS_DIR)).await?;
        write_atomic(
            &dir.join(SESSION_ID_FILE),
            session.id.as_str().as_bytes(),
        )
        .await?;
        self.save(session).await?;
        info!(session = %session.id, "session created at {}", dir.display());
        Ok(())
    }

    /// Persist header, message log, and event ring. Atomic per file from the
    /// perspective of `load`.
    pub async fn save(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(&dir).await?;

        let header = session.header().await;
        write_atomic(
            &dir.join(HEADER_FILE),
            serde_json::to_vec_pretty(&header)?.as_slice(),
        )
        .await?;

        let context = session.context().await;
        let mut log_body = String::new();
        for entry in context.view() {
            log_body.push_str(&serde_json::to_string(entry)?);
            log_body.push('\n');
        }
        drop(context);
        write_atomic(&dir.join(MESSAGES_FILE), log_body.as_bytes()).await?;

        let events = session.bus().history();
        write_atomic(
            &dir.join(EVENTS_FILE),
            serde_json::to_vec_pretty(&events)?.as_slice(),
        )
        .await?;

        debug!(session = %session.id, "session saved");
        Ok(())
    }

    /// Load a persisted session. Expired sessions load but carry the verdict.
    pub async fn load(&self, id: &SessionId) -> Result<LoadedSession> {
        let dir = self.session_dir(id);
        if !dir.join(HEADER_FILE).exists() {
            return Err(Error::SessionNotFound(id.to_string()));
        }

        let header: SessionHeader =
            serde_json::from_slice(&fs::read(dir.join(HEADER_FILE)).await?)?;
        let expired = header.is_expired();

        let entries = read_entries(&dir.join(MESSAGES_FILE)).await?;
        let mut context = ContextLog::new(ContextConfig::default());
        context.replace(entries);

        let session = Session::with_context(
            id.clone(),
            header.policy,
            header.workdir.clone(),
            context,
        );
        session.set_header(header).await;

        let events_path = dir.join(EVENTS_FILE);
        if events_path.exists() {
            let events: Vec<EngineEvent> =
                serde_json::from_slice(&fs::read(&events_path).await?)?;
            session.bus().restore_history(events);
        }

        Ok(LoadedSession {
            session: Arc::new(session),
            expired,
        })
    }

    /// Load for continuation; refuses expired sessions.
    pub async fn resume(&self, id: &SessionId) -> Result<Arc<Session>> {
        let loaded = self.load(id).await?;
        if loaded.expired {
            return Err(Error::SessionExpired(id.to_string()));
        }
        Ok(loaded.session)
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        if !self.root.exists() {
            return Ok(summaries);
        }
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let header_path = entry.path().join(HEADER_FILE);
            if !header_path.exists() {
                continue;
            }
            let Ok(bytes) = fs::read(&header_path).await else {
                continue;
            };
            let Ok(header) = serde_json::from_slice::<SessionHeader>(&bytes) else {
                continue;
            };
            summaries.push(SessionSummary {
                id: header.id.clone(),
                expired: header.is_expired(),
                header,
            });
        }
        summaries.sort_by(|a, b| b.header.last_activity_at.cmp(&a.header.last_activity_at));
        Ok(summaries)
    }

    pub async fn delete(&self, id: &SessionId) -> Result<()> {
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    /// Named immutable snapshot of the session's persisted files.
    pub async fn checkpoint(&self, session: &Session, name: &str) -> Result<()> {
        self.save(session).await?;
        let dir = self.session_dir(&session.id);
        let target = dir.join(CHECKPOINTS_DIR).join(name);
        fs::create_dir_all(&target).await?;
        for file in [HEADER_FILE, MESSAGES_FILE, EVENTS_FILE] {
            let source = dir.join(file);
            if source.exists() {
                fs::copy(&source, target.join(file)).await?;
            }
        }
        info!(session = %session.id, name, "checkpoint written");
        Ok(())
    }

    /// Restore a checkpoint into the live session, replacing its mutable
    /// parts, then persist the restored state.
    pub async fn restore(&self, session: &Session, name: &str) -> Result<()> {
        let dir = self.session_dir(&session.id);
        let source = dir.join(CHECKPOINTS_DIR).join(name);
        if !source.join(HEADER_FILE).exists() {
            return Err(Error::SessionNotFound(format!(
                "{} checkpoint '{}'",
                session.id, name
            )));
        }

        let header: SessionHeader =
            serde_json::from_slice(&fs::read(source.join(HEADER_FILE)).await?)?;
        let entries = read_entries(&source.join(MESSAGES_FILE)).await?;

        // Swap all mutable parts while holding the context lock so readers
        // never observe a half-restored session.
        {
            let mut context = session.context_mut().await;
            context.replace(entries);
            session.set_header(header).await;
        }

        let events_path = source.join(EVENTS_FILE);
        if events_path.exists() {
            let events: Vec<EngineEvent> =
                serde_json::from_slice(&fs::read(&events_path).await?)?;
            session.bus().restore_history(events);
        }

        self.save(session).await?;
        info!(session = %session.id, name, "checkpoint restored");
        Ok(())
    }
}

async fn read_entries(path: &Path) -> Result<Vec<Entry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let body = fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in body.lines() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(line)?);
    }
    Ok(entries)
}

/// Write-temp-then-rename so concurrent readers see old or new, never half.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string())
    ));
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
