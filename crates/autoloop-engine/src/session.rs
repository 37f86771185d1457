//! Session state and the in-process registry
//!
//! A session owns its context log, event bus, and loop sentinel. Turns are
//! strictly sequential within a session; across sessions nothing is shared.

use crate::context::{ContextConfig, ContextLog, LoopSentinel};
use crate::events::EventBus;
use autoloop_core::{ApprovalPolicy, SessionId, TokenUsage};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_EXPIRY_HOURS: i64 = 24;

/// Persisted session header (header.json).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expiry_hours: i64,
    pub turn_count: u64,
    pub token_usage: TokenUsage,
    pub policy: ApprovalPolicy,
    /// Working tree the agent operates on; restored on resume.
    pub workdir: PathBuf,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SessionHeader {
    pub fn new(id: SessionId, policy: ApprovalPolicy, workdir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity_at: now,
            expiry_hours: DEFAULT_EXPIRY_HOURS,
            turn_count: 0,
            token_usage: TokenUsage::default(),
            policy,
            workdir,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity_at > ChronoDuration::hours(self.expiry_hours)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

pub struct Session {
    pub id: SessionId,
    pub workdir: PathBuf,
    header: RwLock<SessionHeader>,
    context: RwLock<ContextLog>,
    sentinel: Mutex<LoopSentinel>,
    bus: EventBus,
}

impl Session {
    pub fn new(id: SessionId, policy: ApprovalPolicy, workdir: impl Into<PathBuf>) -> Self {
        Self::with_context(id, policy, workdir, ContextLog::new(ContextConfig::default()))
    }

    pub fn with_context(
        id: SessionId,
        policy: ApprovalPolicy,
        workdir: impl Into<PathBuf>,
        context: ContextLog,
    ) -> Self {
        let bus = EventBus::new(id.clone());
        let workdir = workdir.into();
        Self {
            header: RwLock::new(SessionHeader::new(id.clone(), policy, workdir.clone())),
            context: RwLock::new(context),
            sentinel: Mutex::new(LoopSentinel::default()),
            bus,
            id,
            workdir,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn header(&self) -> SessionHeader {
        self.header.read().await.clone()
    }

    pub async fn set_header(&self, header: SessionHeader) {
        *self.header.write().await = header;
    }

    pub async fn context(&self) -> tokio::sync::RwLockReadGuard<'_, ContextLog> {
        self.context.read().await
    }

    pub async fn context_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, ContextLog> {
        self.context.write().await
    }

    pub async fn sentinel(&self) -> tokio::sync::MutexGuard<'_, LoopSentinel> {
        self.sentinel.lock().await
    }

    pub async fn touch(&self) {
        self.header.write().await.last_activity_at = Utc::now();
    }

    pub async fn record_turn(&self, usage: TokenUsage) {
        let mut header = self.header.write().await;
        header.turn_count += 1;
        header.token_usage.add(usage);
        header.last_activity_at = Utc::now();
    }

    pub async fn policy(&self) -> ApprovalPolicy {
        self.header.read().await.policy
    }

    pub async fn is_expired(&self) -> bool {
        self.header.read().await.is_expired()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get_or_create(
        &self,
        id: &SessionId,
        policy: ApprovalPolicy,
        workdir: impl Into<PathBuf>,
    ) -> Arc<Session> {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Session::new(id.clone(), policy, workdir)))
            .clone()
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoloop_core::Message;

    #[tokio::test]
    async fn record_turn_updates_counters() {
        let session = Session::new(SessionId::mint(), ApprovalPolicy::Auto, "/tmp");
        session
            .record_turn(TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            })
            .await;
        let header = session.header().await;
        assert_eq!(header.turn_count, 1);
        assert_eq!(header.token_usage.total(), 150);
    }

    #[tokio::test]
    async fn expiry_uses_last_activity() {
        let session = Session::new(SessionId::mint(), ApprovalPolicy::Auto, "/tmp");
        let mut header = session.header().await;
        header.last_activity_at = Utc::now() - ChronoDuration::hours(25);
        session.set_header(header).await;
        assert!(session.is_expired().await);

        session.touch().await;
        assert!(!session.is_expired().await);
    }

    #[tokio::test]
    async fn registry_returns_same_session() {
        let registry = SessionRegistry::new();
        let id = SessionId::mint();
        let a = registry.get_or_create(&id, ApprovalPolicy::Auto, "/tmp");
        let b = registry.get_or_create(&id, ApprovalPolicy::Auto, "/tmp");
        a.context_mut().await.append(Message::user("hi"));
        assert_eq!(b.context().await.len(), 1);
    }

    #[tokio::test]
    async fn registry_remove() {
        let registry = SessionRegistry::new();
        let id = SessionId::mint();
        registry.get_or_create(&id, ApprovalPolicy::Auto, "/tmp");
        assert!(registry.remove(&id).is_some());
        assert!(registry.get(&id).is_none());
    }
}
