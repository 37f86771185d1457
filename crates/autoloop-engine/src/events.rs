//! Per-session event bus
//!
//! Built on `tokio::sync::broadcast`: `emit` never blocks the engine, and a
//! subscriber that falls behind the bounded backlog loses events from the
//! tail and sees a single `backpressure` marker instead. The last 100 events
//! are retained in a ring for replay-from-sequence and session persistence.

use autoloop_core::{EngineEvent, EventKind, SessionId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const HISTORY_CAPACITY: usize = 100;
const SUBSCRIBER_BACKLOG: usize = 256;

/// Cheaply cloneable handle; clones share the same ring and subscribers, so
/// spawned tasks can emit through their own copy.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    session_id: SessionId,
    seq: AtomicU64,
    tx: broadcast::Sender<EngineEvent>,
    history: Mutex<VecDeque<EngineEvent>>,
}

impl EventBus {
    pub fn new(session_id: SessionId) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        Self {
            inner: Arc::new(BusInner {
                session_id,
                seq: AtomicU64::new(0),
                tx,
                history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            }),
        }
    }

    /// Emit an event. Non-blocking; total-ordered per bus.
    pub fn emit(&self, kind: EventKind) -> u64 {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let event = EngineEvent::new(seq, self.inner.session_id.clone(), kind);

        {
            let mut history = self.inner.history.lock().expect("event history poisoned");
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No receivers is fine; production never depends on consumers.
        let _ = self.inner.tx.send(event);
        seq
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Replay buffered events from `from_seq`, plus a live subscription for
    /// what follows. Fails when the requested sequence has already left the
    /// ring.
    pub fn subscribe_from(&self, from_seq: u64) -> Option<(Vec<EngineEvent>, EventSubscription)> {
        let history = self.inner.history.lock().expect("event history poisoned");
        match history.front() {
            Some(oldest) if oldest.seq > from_seq => return None,
            None if from_seq < self.inner.seq.load(Ordering::SeqCst) => return None,
            _ => {}
        }
        let replay: Vec<EngineEvent> = history
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect();
        Some((
            replay,
            EventSubscription {
                rx: self.inner.tx.subscribe(),
            },
        ))
    }

    /// Snapshot of the retained ring, oldest first.
    pub fn history(&self) -> Vec<EngineEvent> {
        self.inner
            .history
            .lock()
            .expect("event history poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Restore the ring from a persisted session. The sequence counter
    /// continues after the newest restored event.
    pub fn restore_history(&self, events: Vec<EngineEvent>) {
        let next = events.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        self.inner.seq.store(next, Ordering::SeqCst);
        let mut history = self.inner.history.lock().expect("event history poisoned");
        history.clear();
        for event in events.into_iter().rev().take(HISTORY_CAPACITY).rev() {
            history.push_back(event);
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<EngineEvent>,
}

impl EventSubscription {
    /// Next event in emission order. A lagged subscriber gets one synthesized
    /// `backpressure` marker, then resumes with the events still buffered.
    /// Returns None when the bus is dropped.
    pub async fn next(&mut self) -> Option<EngineEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                tracing::warn!(dropped, "event subscriber lagged");
                Some(EngineEvent::new(
                    0,
                    SessionId::new("backpressure"),
                    EventKind::Backpressure,
                ))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
