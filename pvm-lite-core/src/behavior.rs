//! Activity behavior extension point.
//!
//! Built-in behaviors are variants of [`Behavior`](crate::graph::Behavior)
//! and are dispatched by the agenda directly. `Behavior::Custom { name, .. }`
//! resolves `name` in a [`BehaviorRegistry`] and drives the registered
//! [`ActivityBehavior`] through a [`BehaviorContext`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::graph::Activity;
use crate::types::*;

#[async_trait]
pub trait ActivityBehavior: Send + Sync {
    /// Called when an execution runs this activity.
    async fn execute(&self, cx: &mut BehaviorContext<'_>) -> Result<()>;

    /// Called when an inactive execution parked here is signalled.
    async fn signal(
        &self,
        cx: &mut BehaviorContext<'_>,
        signal: Option<&str>,
        payload: Variables,
    ) -> Result<()> {
        let _ = (signal, payload);
        Err(EngineError::invalid_state(
            cx.execution_id(),
            format!("activity '{}' does not accept signals", cx.activity().id),
        )
        .into())
    }
}

/// What a custom behavior may see and do while it runs.
pub struct BehaviorContext<'a> {
    cx: &'a mut CommandContext,
    execution: ExecutionId,
    activity: &'a Activity,
    config: &'a str,
}

impl<'a> BehaviorContext<'a> {
    pub(crate) fn new(
        cx: &'a mut CommandContext,
        execution: ExecutionId,
        activity: &'a Activity,
        config: &'a str,
    ) -> Self {
        Self {
            cx,
            execution,
            activity,
            config,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution
    }

    pub fn activity(&self) -> &Activity {
        self.activity
    }

    /// The `config` string of the `Custom` behavior.
    pub fn config(&self) -> &str {
        self.config
    }

    pub fn now(&self) -> Timestamp {
        self.cx.now()
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.cx.variable(self.execution, name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let vars = Variables::from([(name.into(), value.into())]);
        Ok(self.cx.set_variables(self.execution, vars)?)
    }

    /// Leave along the named transition, or the default one for `None`.
    pub fn take(&mut self, transition: Option<&str>) -> Result<()> {
        Ok(self.cx.take_transition(self.execution, transition)?)
    }

    /// Leave like an automatic activity: default transition, or end.
    pub fn leave(&mut self) -> Result<()> {
        Ok(self.cx.leave_activity(self.execution)?)
    }

    /// Park the execution until it is signalled.
    pub fn wait(&mut self) -> Result<()> {
        Ok(self.cx.deactivate(self.execution)?)
    }

    pub fn end(&mut self) {
        self.cx.end_execution(self.execution);
    }

    /// Create a job bound to this execution.
    pub async fn create_job(
        &mut self,
        job_type: &str,
        configuration: impl Into<String> + Send,
        due_at: Timestamp,
    ) -> Result<JobId> {
        let exclusive = self.activity.exclusive;
        Ok(self
            .cx
            .create_job(self.execution, job_type, configuration, due_at, exclusive)
            .await?)
    }
}

// ── BehaviorRegistry ──

#[derive(Default)]
pub struct BehaviorRegistry {
    inner: RwLock<HashMap<String, Arc<dyn ActivityBehavior>>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, behavior: Arc<dyn ActivityBehavior>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner.insert(name.into(), behavior);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityBehavior>> {
        self.inner.read().ok()?.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .map(|inner| inner.contains_key(name))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .map(|inner| inner.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
