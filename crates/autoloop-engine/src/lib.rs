//! Autoloop engine — context manager, tool orchestrator, turn engine,
//! event bus, and session persistence
//!
//! One session owns its context log, event bus, and loop sentinel; turns are
//! strictly sequential within a session. The store makes every piece of
//! mutable state resumable across process restarts.

pub mod context;
pub mod events;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod turn;

pub use context::{ContextConfig, ContextLog, LoopSentinel};
pub use events::{EventBus, EventSubscription};
pub use orchestrator::{OrchestratorConfig, ToolOrchestrator};
pub use session::{Session, SessionHeader, SessionRegistry};
pub use store::{FsSessionStore, LoadedSession, SessionSummary};
pub use turn::{TurnConfig, TurnEngine, TurnOutcome};
