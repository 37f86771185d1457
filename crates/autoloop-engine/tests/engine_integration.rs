//! Engine-level integration: turns, events, compaction, and persistence
//! working together

use autoloop_core::{ApprovalPolicy, EventKind, Role, SessionId, TurnEndReason};
use autoloop_engine::{
    ContextConfig, ContextLog, FsSessionStore, Session, ToolOrchestrator, TurnConfig, TurnEngine,
};
use autoloop_llm::{LlmDriver, RetryBudget, ScriptedProvider};
use autoloop_tools::SafetyGate;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn engine(provider: ScriptedProvider, workdir: &std::path::Path) -> TurnEngine {
    let driver = Arc::new(LlmDriver::new(
        Arc::new(provider),
        Arc::new(RetryBudget::default()),
    ));
    let registry = Arc::new(autoloop_tools::default_registry(workdir));
    let gate = Arc::new(SafetyGate::new(ApprovalPolicy::Auto, workdir));
    TurnEngine::new(
        driver,
        ToolOrchestrator::new(registry, gate),
        TurnConfig::default(),
    )
}

#[tokio::test]
async fn subscriber_sees_full_event_sequence_for_a_tool_turn() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f.txt"), "data").unwrap();
    let engine = engine(
        ScriptedProvider::new()
            .with_tool_turn("read_file", json!({"file_path": "f.txt"}))
            .with_text_turn("done reading"),
        tmp.path(),
    );
    let session = Session::new(SessionId::mint(), ApprovalPolicy::Auto, tmp.path());
    let mut sub = session.bus().subscribe();

    engine
        .run_turn(&session, "read f.txt", CancellationToken::new())
        .await;

    let mut kinds = Vec::new();
    // agent_start .. agent_end are all buffered; drain until agent_end.
    while let Some(event) = sub.next().await {
        let done = matches!(event.kind, EventKind::AgentEnd { .. });
        kinds.push(event.kind);
        if done {
            break;
        }
    }

    assert!(matches!(kinds.first(), Some(EventKind::AgentStart)));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::ToolCallStart { name, .. } if name == "read_file")));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::ToolCallComplete { ok: true, .. })));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::TextDelta { .. })));
    assert!(matches!(
        kinds.last(),
        Some(EventKind::AgentEnd {
            reason: TurnEndReason::Completed
        })
    ));

    // Event sequence numbers are strictly increasing in emission order.
    let history = session.bus().history();
    for pair in history.windows(2) {
        assert_eq!(pair[1].seq, pair[0].seq + 1);
    }
}

#[tokio::test]
async fn multi_turn_session_compacts_and_survives_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let workdir = tmp.path().join("ws");
    std::fs::create_dir_all(&workdir).unwrap();
    let store = FsSessionStore::new(tmp.path().join("sessions"));

    // A tight context budget so a handful of turns forces compaction.
    let mut provider = ScriptedProvider::new();
    for i in 0..12 {
        provider = provider.with_text_turn(format!(
            "working through step {} of the refactoring plan with details",
            i
        ));
    }
    let engine = engine(provider, &workdir);
    let context = ContextLog::new(ContextConfig {
        max_tokens: 300,
        target_ratio: 0.75,
        retain_tail: 4,
    });
    let session = Arc::new(Session::with_context(
        SessionId::mint(),
        ApprovalPolicy::Auto,
        &workdir,
        context,
    ));
    store.create(&session).await.unwrap();

    for i in 0..12 {
        engine
            .run_turn(
                &session,
                &format!("continue with step {}", i),
                CancellationToken::new(),
            )
            .await;
        store.save(&session).await.unwrap();
    }

    {
        let context = session.context().await;
        assert!(context.len() < 24, "compaction should have folded messages");
        assert!(context.tool_pairs_intact());
        // The newest exchange always survives.
        assert!(context.view().last().unwrap().message.text().contains("step 11"));
    }

    // Reload and confirm the persisted view matches the live one.
    let loaded = store.load(&session.id).await.unwrap();
    let live = session.context().await;
    let reloaded = loaded.session.context().await;
    assert_eq!(live.len(), reloaded.len());
    assert_eq!(live.token_total(), reloaded.token_total());
    assert_eq!(
        loaded.session.header().await.turn_count,
        session.header().await.turn_count
    );
}

#[tokio::test]
async fn tool_pairs_survive_compaction_across_turns() {
    let tmp = tempfile::tempdir().unwrap();
    let workdir = tmp.path().join("ws");
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("notes.txt"), "note body text").unwrap();

    let mut provider = ScriptedProvider::new();
    for i in 0..8 {
        provider = provider
            .with_tool_turn("read_file", json!({"file_path": "notes.txt", "offset": i}))
            .with_text_turn(format!("checked the notes file pass {}", i));
    }
    let engine = engine(provider, &workdir);
    let session = Arc::new(Session::with_context(
        SessionId::mint(),
        ApprovalPolicy::Auto,
        &workdir,
        ContextLog::new(ContextConfig {
            max_tokens: 400,
            target_ratio: 0.75,
            retain_tail: 6,
        }),
    ));

    for i in 0..8 {
        engine
            .run_turn(
                &session,
                &format!("check the notes, round {}", i),
                CancellationToken::new(),
            )
            .await;
    }

    let context = session.context().await;
    assert!(context.tool_pairs_intact());
    // No tool-role message may lead the retained sequence.
    assert_ne!(context.view().first().unwrap().message.role, Role::Tool);
}
