//! autoloop CLI - run the autonomous loop, drive single turns, inspect
//! sessions

use autoloop::supervisor::{
    self, continuity, AutonomousSupervisor, CircuitBreaker, PromptBundle, RateLimiter,
    SupervisorConfig,
};
use autoloop_core::{ApprovalPolicy, SessionId};
use autoloop_engine::{
    FsSessionStore, OrchestratorConfig, ToolOrchestrator, TurnConfig, TurnEngine,
};
use autoloop_llm::{AnthropicProvider, LlmDriver, RetryBudget};
use autoloop_tools::{SafetyGate, SafetyGateConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "autoloop", about = "Autonomous coding-agent runtime")]
struct Cli {
    /// Root directory for session persistence
    #[arg(long, env = "AUTOLOOP_SESSION_ROOT", default_value = ".autoloop/sessions")]
    session_root: PathBuf,

    /// Working directory the agent operates on
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autonomous loop until completion or a guard halts it
    Run {
        /// Instruction document driving the loop
        #[arg(long)]
        instructions: PathBuf,

        /// Optional checklist document
        #[arg(long)]
        checklist: Option<PathBuf>,

        /// Optional build/run notes document
        #[arg(long)]
        build_notes: Option<PathBuf>,

        /// Maximum iterations
        #[arg(long, env = "AUTOLOOP_MAX_LOOPS", default_value_t = 20)]
        max_loops: u64,

        /// Approval policy (yolo|auto|auto-edit|on-request|on-failure|never)
        #[arg(long, env = "AUTOLOOP_POLICY", default_value = "auto")]
        policy: ApprovalPolicy,

        /// Model to drive
        #[arg(long, default_value = "claude-sonnet-4-20250514")]
        model: String,

        /// LLM calls allowed per rate window
        #[arg(long, env = "AUTOLOOP_RATE_MAX_CALLS", default_value_t = 100)]
        rate_max_calls: u32,

        /// Rate window length in seconds
        #[arg(long, env = "AUTOLOOP_RATE_WINDOW_SECS", default_value_t = 3600)]
        rate_window_secs: i64,

        /// Session idle expiry in hours
        #[arg(long, env = "AUTOLOOP_SESSION_EXPIRY_HOURS", default_value_t = 24)]
        session_expiry_hours: i64,

        /// Concurrent tool calls per round (1 = serial)
        #[arg(long, default_value_t = 1)]
        tool_parallelism: usize,
    },

    /// Run a single interactive turn against a new or resumed session
    Turn {
        /// The user message
        #[arg(long)]
        prompt: String,

        #[arg(long, env = "AUTOLOOP_POLICY", default_value = "auto")]
        policy: ApprovalPolicy,

        #[arg(long, default_value = "claude-sonnet-4-20250514")]
        model: String,
    },

    /// Inspect or manage persisted sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Reset the circuit breaker recorded for the current session
    Circuit {
        #[command(subcommand)]
        action: CircuitAction,
    },

    /// Print the latest supervisor status snapshot
    Status,
}

#[derive(Subcommand)]
enum SessionAction {
    List,
    Show { id: String },
    Delete { id: String },
}

#[derive(Subcommand)]
enum CircuitAction {
    Reset,
}

/// Set up tracing on stderr, or a non-blocking rolling file when
/// AUTOLOOP_LOG_DIR is set. The returned guard must outlive the process body.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Ok(dir) = std::env::var("AUTOLOOP_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "autoloop.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}

fn api_key() -> anyhow::Result<String> {
    std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY is not set"))
}

fn build_driver(api_key: &str) -> Arc<LlmDriver> {
    let client = reqwest::Client::new();
    let mut provider = AnthropicProvider::new(client, api_key);
    if let Ok(base) = std::env::var("ANTHROPIC_BASE_URL") {
        provider = provider.with_base_url(base);
    }
    Arc::new(LlmDriver::new(
        Arc::new(provider),
        Arc::new(RetryBudget::default()),
    ))
}

fn build_engine(
    api_key: &str,
    workdir: &PathBuf,
    policy: ApprovalPolicy,
    model: String,
    tool_parallelism: usize,
) -> TurnEngine {
    let registry = Arc::new(autoloop_tools::default_registry(workdir));
    let gate = Arc::new(
        SafetyGate::new(policy, workdir.clone()).with_config(SafetyGateConfig {
            allowed_roots: vec![],
            secret_values: vec![api_key.to_string()],
        }),
    );
    let orchestrator = ToolOrchestrator::new(registry, gate).with_config(OrchestratorConfig {
        parallelism: tool_parallelism,
        ..Default::default()
    });
    TurnEngine::new(
        build_driver(api_key),
        orchestrator,
        TurnConfig {
            model,
            ..Default::default()
        },
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();
    let store = FsSessionStore::new(&cli.session_root);

    match cli.command {
        Command::Run {
            instructions,
            checklist,
            build_notes,
            max_loops,
            policy,
            model,
            rate_max_calls,
            rate_window_secs,
            session_expiry_hours,
            tool_parallelism,
        } => {
            let key = api_key()?;
            let bundle =
                PromptBundle::load(&instructions, checklist.as_ref(), build_notes.as_ref())
                    .await?;
            let engine = build_engine(&key, &cli.workdir, policy, model, tool_parallelism);

            let session = continuity::resolve_session(&store, policy, &cli.workdir).await?;
            if session_expiry_hours != autoloop_engine::session::DEFAULT_EXPIRY_HOURS {
                let mut header = session.header().await;
                header.expiry_hours = session_expiry_hours;
                session.set_header(header).await;
            }

            let session_dir = store.session_dir(&session.id);
            let limiter = RateLimiter::load(
                session_dir.join("call_count"),
                rate_max_calls,
                rate_window_secs,
            )
            .await;

            // Restore circuit state from the last status snapshot, if any.
            let mut circuit = CircuitBreaker::default();
            if let Ok(status) = supervisor::read_status(&session_dir.join("status.json")).await {
                circuit.restore(
                    status.circuit_breaker.state,
                    supervisor::circuit::CircuitCounters {
                        no_progress: status.circuit_breaker.no_progress_count,
                        consecutive_errors: status.circuit_breaker.consecutive_errors,
                        completion_signals: status.circuit_breaker.completion_signals,
                        permission_denials: status.circuit_breaker.permission_denials,
                    },
                );
            }

            let cancel = CancellationToken::new();
            let ctrlc_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    ctrlc_cancel.cancel();
                }
            });

            let runner = AutonomousSupervisor::new(
                store,
                engine,
                session,
                bundle,
                circuit,
                limiter,
                SupervisorConfig {
                    max_iterations: max_loops,
                    ..Default::default()
                },
                cancel,
            );
            let report = runner.run().await?;
            println!(
                "halted: {} after {} iteration(s)",
                report.reason, report.iterations
            );
            std::process::exit(report.reason.exit_code());
        }

        Command::Turn {
            prompt,
            policy,
            model,
        } => {
            let key = api_key()?;
            let engine = build_engine(&key, &cli.workdir, policy, model, 1);
            let session = continuity::resolve_session(&store, policy, &cli.workdir).await?;

            // Print streamed text as it arrives.
            let mut sub = session.bus().subscribe();
            let printer = tokio::spawn(async move {
                while let Some(event) = sub.next().await {
                    if let autoloop_core::EventKind::TextDelta { text } = event.kind {
                        print!("{}", text);
                        use std::io::Write;
                        let _ = std::io::stdout().flush();
                    }
                }
            });

            let outcome = engine
                .run_turn(&session, &prompt, CancellationToken::new())
                .await;
            store.save(&session).await?;
            drop(printer);
            println!();
            if let Some(error) = outcome.error {
                eprintln!("turn error: {} ({})", error.message, error.code);
                std::process::exit(1);
            }
        }

        Command::Sessions { action } => match action {
            SessionAction::List => {
                for summary in store.list().await? {
                    println!(
                        "{}  turns={}  tokens={}  last_active={}  {}",
                        summary.id,
                        summary.header.turn_count,
                        summary.header.token_usage.total(),
                        summary.header.last_activity_at.format("%Y-%m-%dT%H:%M:%SZ"),
                        if summary.expired { "expired" } else { "active" },
                    );
                }
            }
            SessionAction::Show { id } => {
                let loaded = store.load(&SessionId::new(id)).await?;
                let header = loaded.session.header().await;
                println!("{}", serde_json::to_string_pretty(&header)?);
                for entry in loaded.session.context().await.view() {
                    println!(
                        "[{:>4}] {:?}: {}",
                        entry.index,
                        entry.message.role,
                        entry.message.text().lines().next().unwrap_or_default()
                    );
                }
            }
            SessionAction::Delete { id } => {
                store.delete(&SessionId::new(id)).await?;
                println!("deleted");
            }
        },

        Command::Circuit { action } => match action {
            CircuitAction::Reset => {
                let Some(id) = continuity::read_pointer(store.root()).await else {
                    anyhow::bail!("no current session");
                };
                let status_path = store.session_dir(&id).join("status.json");
                let mut status = supervisor::read_status(&status_path).await?;
                let mut circuit = CircuitBreaker::default();
                circuit.restore(
                    status.circuit_breaker.state,
                    supervisor::circuit::CircuitCounters::default(),
                );
                circuit.reset();
                status.circuit_breaker =
                    supervisor::status::CircuitStatus::from_breaker(&circuit);
                supervisor::write_status(&status_path, &status).await?;
                println!("circuit: {}", circuit.state());
            }
        },

        Command::Status => {
            let Some(id) = continuity::read_pointer(store.root()).await else {
                anyhow::bail!("no current session");
            };
            let status =
                supervisor::read_status(&store.session_dir(&id).join("status.json")).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
