//! Turn engine - one LLM call plus the tool rounds it triggers
//!
//! PREPARE → CALL_LLM → (stream text | collect tool calls) →
//! (EXECUTE_TOOLS → APPEND_RESULTS → CALL_LLM)* → FINALIZE
//!
//! Cancellation is honored at every CALL_LLM boundary and inside tool
//! handlers; a cancelled turn still leaves the session consistent.

use crate::orchestrator::ToolOrchestrator;
use crate::session::Session;
use autoloop_core::{
    ErrorReport, EventKind, Message, TokenUsage, ToolCall, TurnEndReason,
};
use autoloop_llm::{AccumulatedToolCall, LlmDriver, LlmError, LlmRequest, StreamDelta};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BREAKER_MESSAGE: &str = "You appear to be repeating the same action with the same \
arguments. Step back, reassess the approach, and either try something different or \
explain why you are stuck.";

#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub max_tool_iterations: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            system_prompt: None,
            max_tool_iterations: 8,
        }
    }
}

/// What one turn produced.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// Final assistant text (the last round's text content).
    pub assistant_text: String,
    pub reason: TurnEndReason,
    pub tool_rounds: usize,
    pub usage: TokenUsage,
    pub loop_detected: bool,
    pub error: Option<ErrorReport>,
}

pub struct TurnEngine {
    driver: Arc<LlmDriver>,
    orchestrator: ToolOrchestrator,
    config: TurnConfig,
}

impl TurnEngine {
    pub fn new(driver: Arc<LlmDriver>, orchestrator: ToolOrchestrator, config: TurnConfig) -> Self {
        Self {
            driver,
            orchestrator,
            config,
        }
    }

    pub fn orchestrator(&self) -> &ToolOrchestrator {
        &self.orchestrator
    }

    /// Run one full turn for the session.
    pub async fn run_turn(
        &self,
        session: &Session,
        user_message: &str,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let bus = session.bus().clone();
        bus.emit(EventKind::AgentStart);

        session
            .context_mut()
            .await
            .append(Message::user(user_message));

        let mut rounds = 0usize;
        let mut final_text = String::new();
        let mut usage = TokenUsage::default();
        let mut loop_detected = false;
        let mut error: Option<ErrorReport> = None;

        let reason = loop {
            if cancel.is_cancelled() {
                debug!(session = %session.id, "turn cancelled at call boundary");
                break TurnEndReason::Cancelled;
            }

            rounds += 1;
            if rounds > self.config.max_tool_iterations {
                session.context_mut().await.append(Message::system(
                    "Tool iteration budget exhausted; the turn was ended by the engine.",
                ));
                break TurnEndReason::ToolBudgetExhausted;
            }

            // Compaction boundary before each LLM call.
            let request = {
                let mut context = session.context_mut().await;
                if context.needs_compaction() {
                    context.compact();
                }
                LlmRequest {
                    model: self.config.model.clone(),
                    messages: autoloop_llm::types::to_wire(&context.messages()),
                    tools: Some(self.orchestrator.registry().definitions()),
                    max_tokens: Some(self.config.max_tokens),
                    temperature: None,
                    system: self.config.system_prompt.clone(),
                }
            };

            let stream = match self.driver.open_stream(request, cancel.clone()).await {
                Ok(s) => s,
                Err(LlmError::Cancelled) => break TurnEndReason::Cancelled,
                Err(e) => {
                    let report = autoloop_core::Error::LlmFatal(e.to_string()).report();
                    bus.emit(EventKind::AgentError {
                        error: report.clone(),
                    });
                    error = Some(report);
                    break TurnEndReason::Error;
                }
            };

            let round = pump_stream(stream, &bus, &cancel).await;
            if let Some(u) = round.usage {
                usage.add(TokenUsage {
                    input_tokens: u.input_tokens as u64,
                    output_tokens: u.output_tokens as u64,
                });
            }

            // Persist whatever arrived before acting on errors/cancellation.
            let tool_calls: Vec<ToolCall> = round
                .tool_calls
                .into_iter()
                .map(AccumulatedToolCall::into_tool_call)
                .collect();

            {
                let mut context = session.context_mut().await;
                if tool_calls.is_empty() {
                    if !round.text.is_empty() || !round.cancelled {
                        context.append(Message::assistant(round.text.clone()));
                    }
                } else {
                    context.append(Message::assistant_with_tools(
                        round.text.clone(),
                        tool_calls.clone(),
                    ));
                }
            }
            if !round.text.is_empty() {
                bus.emit(EventKind::TextComplete {
                    text: round.text.clone(),
                });
                final_text = round.text;
            }

            if round.cancelled {
                // Any appended tool_use blocks still need results for log
                // integrity before the turn ends.
                if !tool_calls.is_empty() {
                    let mut context = session.context_mut().await;
                    for call in &tool_calls {
                        context.append(Message::tool_result(
                            call.id.clone(),
                            "Error: cancelled before execution",
                        ));
                    }
                }
                break TurnEndReason::Cancelled;
            }
            if let Some(stream_error) = round.error {
                let report = autoloop_core::Error::LlmFatal(stream_error).report();
                bus.emit(EventKind::AgentError {
                    error: report.clone(),
                });
                error = Some(report);
                // Tool calls from a broken stream are not executed; but any
                // already-appended tool_use blocks need results for log
                // integrity.
                if !tool_calls.is_empty() {
                    let mut context = session.context_mut().await;
                    for call in &tool_calls {
                        context.append(Message::tool_result(
                            call.id.clone(),
                            "Error: stream aborted before execution",
                        ));
                    }
                }
                break TurnEndReason::Error;
            }

            if tool_calls.is_empty() {
                break TurnEndReason::Completed;
            }

            // Repetition detection feeds the breaker via the outcome.
            let mut tripped = false;
            {
                let mut sentinel = session.sentinel().await;
                for call in &tool_calls {
                    if sentinel.note_action(call) {
                        tripped = true;
                    }
                }
            }

            self.orchestrator
                .execute_round(
                    &tool_calls,
                    &mut *session.context_mut().await,
                    &bus,
                    &session.workdir,
                    &cancel,
                )
                .await;

            if tripped {
                warn!(session = %session.id, "repetition loop detected, injecting breaker");
                loop_detected = true;
                session
                    .context_mut()
                    .await
                    .append(Message::user(BREAKER_MESSAGE));
            }

            debug!(session = %session.id, rounds, "tool round complete, continuing");
        };

        session.record_turn(usage).await;
        bus.emit(EventKind::AgentEnd { reason });

        info!(
            session = %session.id,
            ?reason,
            rounds,
            tokens = usage.total(),
            "turn finished"
        );

        TurnOutcome {
            assistant_text: final_text,
            reason,
            tool_rounds: rounds.saturating_sub(1),
            usage,
            loop_detected,
            error,
        }
    }
}

struct RoundResult {
    text: String,
    tool_calls: Vec<AccumulatedToolCall>,
    usage: Option<autoloop_llm::Usage>,
    cancelled: bool,
    error: Option<String>,
}

async fn pump_stream(
    stream: autoloop_llm::LlmStream,
    bus: &crate::events::EventBus,
    cancel: &CancellationToken,
) -> RoundResult {
    let mut result = RoundResult {
        text: String::new(),
        tool_calls: Vec::new(),
        usage: None,
        cancelled: false,
        error: None,
    };
    let mut current_tool: Option<AccumulatedToolCall> = None;

    tokio::pin!(stream);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                result.cancelled = true;
                break;
            }
            delta_opt = stream.next() => {
                match delta_opt {
                    Some(Ok(delta)) => match delta {
                        StreamDelta::Text(text) => {
                            result.text.push_str(&text);
                            bus.emit(EventKind::TextDelta { text });
                        }
                        StreamDelta::Thinking(_) => {}
                        StreamDelta::ToolCallStart { id, name } => {
                            current_tool = Some(AccumulatedToolCall {
                                id,
                                name,
                                arguments: String::new(),
                            });
                        }
                        StreamDelta::ToolCallDelta { arguments, .. } => {
                            if let Some(ref mut tool) = current_tool {
                                tool.arguments.push_str(&arguments);
                            }
                        }
                        StreamDelta::ToolCallEnd { .. } => {
                            if let Some(tool) = current_tool.take() {
                                result.tool_calls.push(tool);
                            }
                        }
                        StreamDelta::Done { usage, .. } => {
                            result.usage = usage;
                        }
                        StreamDelta::Error(e) => {
                            result.error = Some(e);
                        }
                    },
                    Some(Err(LlmError::Cancelled)) => {
                        result.cancelled = true;
                        break;
                    }
                    Some(Err(e)) => {
                        result.error = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    result
}
