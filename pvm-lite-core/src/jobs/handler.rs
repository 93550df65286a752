use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::CommandContext;
use crate::types::Job;

/// Fires a timer activity's outgoing transition.
pub const TIMER_TRANSITION: &str = "timer-transition";

/// Runs the behavior of an `asynchronous` activity.
pub const ASYNC_CONTINUATION: &str = "async-continuation";

/// Work behind a job type. Runs inside the `ExecuteJob` unit of work with the
/// job's instance loaded; the job row is already scheduled for deletion.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job, cx: &mut CommandContext) -> Result<()>;
}

#[derive(Default)]
pub struct JobHandlerRegistry {
    inner: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        if let Ok(mut inner) = registry.inner.write() {
            inner.insert(TIMER_TRANSITION.to_string(), Arc::new(TimerTransitionHandler));
            inner.insert(
                ASYNC_CONTINUATION.to_string(),
                Arc::new(AsyncContinuationHandler),
            );
        }
        registry
    }

    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner.insert(job_type.into(), handler);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.inner.read().ok()?.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .read()
            .map(|inner| inner.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }
}

/// True if the job's execution still waits at the activity the job was
/// created for. A stale job completes without effect.
fn still_parked(job: &Job, cx: &CommandContext) -> bool {
    match cx.execution(job.execution_id) {
        Some(execution) => !execution.is_active && execution.is_at(&job.configuration),
        None => false,
    }
}

pub struct TimerTransitionHandler;

#[async_trait]
impl JobHandler for TimerTransitionHandler {
    async fn execute(&self, job: &Job, cx: &mut CommandContext) -> Result<()> {
        if !still_parked(job, cx) {
            tracing::debug!(job_id = %job.id, "Timer fired for a moved execution, ignoring");
            return Ok(());
        }
        cx.leave_activity(job.execution_id)?;
        Ok(())
    }
}

pub struct AsyncContinuationHandler;

#[async_trait]
impl JobHandler for AsyncContinuationHandler {
    async fn execute(&self, job: &Job, cx: &mut CommandContext) -> Result<()> {
        if !still_parked(job, cx) {
            tracing::debug!(job_id = %job.id, "Async continuation for a moved execution, ignoring");
            return Ok(());
        }
        cx.resume_activity(job.execution_id)?;
        Ok(())
    }
}
