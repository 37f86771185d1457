//! LLM driver - provider access with retry discipline
//!
//! The driver opens streams on behalf of the turn engine. Transient failures
//! while opening retry with exponential backoff under the shared budget;
//! failures mid-stream are not retried (the turn engine surfaces them).

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::retry::{BackoffConfig, RetryBudget};
use crate::types::LlmRequest;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: BackoffConfig::default(),
        }
    }
}

pub struct LlmDriver {
    provider: Arc<dyn LlmProvider>,
    budget: Arc<RetryBudget>,
    config: DriverConfig,
}

impl LlmDriver {
    pub fn new(provider: Arc<dyn LlmProvider>, budget: Arc<RetryBudget>) -> Self {
        Self {
            provider,
            budget,
            config: DriverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Open a completion stream, retrying transient open failures.
    pub async fn open_stream(
        &self,
        request: LlmRequest,
        cancel: CancellationToken,
    ) -> LlmResult<LlmStream> {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            match self
                .provider
                .complete_stream(request.clone(), cancel.clone())
                .await
            {
                Ok(stream) => {
                    self.budget.deposit();
                    return Ok(stream);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    if !self.budget.try_withdraw() {
                        warn!("retry budget exhausted, propagating: {}", e);
                        return Err(e);
                    }
                    let delay = match &e {
                        LlmError::RateLimited { retry_after_ms } => {
                            std::time::Duration::from_millis(*retry_after_ms)
                                .min(std::time::Duration::from_millis(self.config.backoff.max_ms))
                        }
                        _ => self.config.backoff.delay_for(attempt),
                    };
                    debug!(attempt, ?delay, "transient llm failure, retrying: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
