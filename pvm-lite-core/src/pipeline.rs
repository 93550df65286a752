//! Command pipeline.
//!
//! Every entry point runs as a [`Command`] through [`CommandExecutor`], which
//! wraps it in three fixed layers, outermost first:
//!
//! 1. optimistic retry: a `WriteConflict` re-runs the command from scratch,
//!    up to `write_conflict_retries` times;
//! 2. context scope: a fresh [`CommandContext`] per attempt, dropped on every
//!    exit path, with failures logged;
//! 3. transaction: run the command, drain the agenda, commit the change set,
//!    then fire post-commit hooks.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::Instrument;

use crate::context::CommandContext;
use crate::engine::EngineServices;
use crate::error::EngineError;

#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    /// Span and log name.
    fn name(&self) -> &'static str;

    /// Read state and push operations. May run more than once.
    async fn execute(&self, cx: &mut CommandContext) -> Result<Self::Output, EngineError>;
}

#[derive(Clone)]
pub struct CommandExecutor {
    services: Arc<EngineServices>,
}

impl CommandExecutor {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, EngineError> {
        let span = tracing::debug_span!("command", name = command.name());
        self.with_retry(command).instrument(span).await
    }

    async fn with_retry<C: Command>(&self, command: &C) -> Result<C::Output, EngineError> {
        let retries = self.services.config.write_conflict_retries;
        let mut attempt: u32 = 1;
        loop {
            match self.in_context(command).await {
                Err(EngineError::WriteConflict { entity, .. }) if attempt <= retries => {
                    tracing::warn!(
                        command = command.name(),
                        attempt,
                        entity = %entity,
                        "Write conflict, retrying command"
                    );
                    attempt += 1;
                }
                Err(EngineError::WriteConflict { entity, .. }) => {
                    tracing::warn!(
                        command = command.name(),
                        attempts = attempt,
                        entity = %entity,
                        "Write conflict retries exhausted"
                    );
                    return Err(EngineError::WriteConflict {
                        entity,
                        attempts: attempt,
                    });
                }
                other => return other,
            }
        }
    }

    async fn in_context<C: Command>(&self, command: &C) -> Result<C::Output, EngineError> {
        let cx = CommandContext::new(self.services.clone());
        let result = self.in_transaction(command, cx).await;

        if let Err(e) = &result {
            if e.is_retryable() {
                tracing::debug!(command = command.name(), error = %e, "Command attempt conflicted");
            } else if self.services.shutting_down.load(Ordering::SeqCst) {
                tracing::warn!(command = command.name(), error = %e, "Command failed during shutdown");
            } else {
                tracing::error!(command = command.name(), error = %e, "Command failed");
            }
        }
        result
    }

    async fn in_transaction<C: Command>(
        &self,
        command: &C,
        mut cx: CommandContext,
    ) -> Result<C::Output, EngineError> {
        let output = command.execute(&mut cx).await?;
        cx.drain_agenda().await?;

        let (changes, hooks) = cx.into_changes();
        if !changes.is_empty() {
            let writes = changes.write_count();
            let events = changes.events.len();
            self.services.store.commit(changes).await?;
            tracing::debug!(command = command.name(), writes, events, "Committed");
        }
        for hook in hooks {
            hook();
        }
        Ok(output)
    }
}
