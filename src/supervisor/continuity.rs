//! Session continuity - resume the prior session id when still fresh
//!
//! A workspace-level `session.id` pointer records the most recent
//! autonomous session. On start the supervisor resumes it when it exists
//! and has not expired; otherwise a new session is minted.

use autoloop_core::{ApprovalPolicy, Error, Result, SessionId};
use autoloop_engine::store::write_atomic;
use autoloop_engine::{FsSessionStore, Session};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const POINTER_FILE: &str = "session.id";

pub fn pointer_path(session_root: &Path) -> PathBuf {
    session_root.join(POINTER_FILE)
}

pub async fn read_pointer(session_root: &Path) -> Option<SessionId> {
    let raw = tokio::fs::read_to_string(pointer_path(session_root))
        .await
        .ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(SessionId::new(trimmed))
    }
}

pub async fn write_pointer(session_root: &Path, id: &SessionId) -> Result<()> {
    write_atomic(&pointer_path(session_root), id.as_str().as_bytes()).await
}

/// Resume the pointed-at session, or mint a fresh one. Expired or missing
/// prior sessions fall through to a new session, never an error.
pub async fn resolve_session(
    store: &FsSessionStore,
    policy: ApprovalPolicy,
    workdir: &Path,
) -> Result<Arc<Session>> {
    if let Some(prior) = read_pointer(store.root()).await {
        match store.resume(&prior).await {
            Ok(session) => {
                info!(session = %prior, "resuming prior session");
                session.touch().await;
                return Ok(session);
            }
            Err(Error::SessionExpired(_)) => {
                info!(session = %prior, "prior session expired, starting fresh");
            }
            Err(Error::SessionNotFound(_)) => {
                info!(session = %prior, "prior session missing, starting fresh");
            }
            Err(e) => return Err(e),
        }
    }

    let session = Arc::new(Session::new(SessionId::mint(), policy, workdir));
    store.create(&session).await?;
    write_pointer(store.root(), &session.id).await?;
    info!(session = %session.id, "minted new session");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    #[tokio::test]
    async fn mints_when_no_pointer() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(tmp.path().join("sessions"));
        let session = resolve_session(&store, ApprovalPolicy::Auto, tmp.path())
            .await
            .unwrap();
        assert_eq!(
            read_pointer(store.root()).await.unwrap().as_str(),
            session.id.as_str()
        );
    }

    #[tokio::test]
    async fn resumes_fresh_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(tmp.path().join("sessions"));
        let first = resolve_session(&store, ApprovalPolicy::Auto, tmp.path())
            .await
            .unwrap();
        let second = resolve_session(&store, ApprovalPolicy::Auto, tmp.path())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn expired_pointer_mints_new() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(tmp.path().join("sessions"));
        let first = resolve_session(&store, ApprovalPolicy::Auto, tmp.path())
            .await
            .unwrap();

        let mut header = first.header().await;
        header.last_activity_at = Utc::now() - ChronoDuration::hours(30);
        first.set_header(header).await;
        store.save(&first).await.unwrap();

        let second = resolve_session(&store, ApprovalPolicy::Auto, tmp.path())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }
}
