//! Per-attempt unit-of-work context.
//!
//! A `CommandContext` owns the working set of everything a command touches,
//! the agenda, the buffered runtime events and the post-commit hooks. It is
//! created fresh for every attempt and dropped afterwards; only a successful
//! commit makes any of it visible.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::agenda::{Agenda, Operation};
use crate::config::EngineConfig;
use crate::engine::EngineServices;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::repository::ProcessDefinition;
use crate::store::ChangeSet;
use crate::tree::{collect_changes, ExecutionTree, JobSet};
use crate::types::*;

/// Side effect deferred until the unit of work has committed.
pub type PostCommitHook = Box<dyn FnOnce() + Send + Sync>;

pub struct CommandContext {
    services: Arc<EngineServices>,
    now: Timestamp,
    pub(crate) tree: ExecutionTree,
    pub(crate) jobs: JobSet,
    pub(crate) agenda: Agenda,
    events: Vec<(ExecutionId, RuntimeEvent)>,
    verified_jobs: Vec<(JobId, u32)>,
    post_commit: Vec<PostCommitHook>,
    loaded_instances: BTreeSet<ExecutionId>,
}

impl CommandContext {
    pub(crate) fn new(services: Arc<EngineServices>) -> Self {
        let now = services.clock.now();
        let agenda = Agenda::new(services.config.agenda_limit);
        Self {
            services,
            now,
            tree: ExecutionTree::default(),
            jobs: JobSet::default(),
            agenda,
            events: Vec::new(),
            verified_jobs: Vec::new(),
            post_commit: Vec::new(),
            loaded_instances: BTreeSet::new(),
        }
    }

    /// The unit of work's notion of "now", fixed when the context is opened.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub(crate) fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    // ── Loading ──

    /// Bring every execution and job of an instance into the working set.
    pub async fn load_instance(&mut self, instance_id: ExecutionId) -> Result<(), EngineError> {
        if !self.loaded_instances.insert(instance_id) {
            return Ok(());
        }
        let store = &self.services.store;
        let executions = store.load_executions(instance_id).await?;
        let jobs = store.load_jobs_for_instance(instance_id).await?;
        self.tree.load(executions);
        self.jobs.load(jobs);
        Ok(())
    }

    /// Load an execution together with the rest of its instance.
    pub async fn load_execution(&mut self, id: ExecutionId) -> Result<Execution, EngineError> {
        if let Some(execution) = self.tree.get(id) {
            return Ok(execution.clone());
        }
        let execution = self
            .services
            .store
            .load_execution(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(id))?;
        self.load_instance(execution.process_instance_id).await?;
        self.tree
            .get(id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    /// Load a single job row without its instance.
    pub async fn load_job(&mut self, id: JobId) -> Result<Job, EngineError> {
        if let Some(job) = self.jobs.get(id) {
            return Ok(job.clone());
        }
        if self.jobs.is_loaded(id) {
            // Deleted earlier in this unit of work.
            return Err(EngineError::JobNotFound(id));
        }
        let job = self
            .services
            .store
            .load_job(id)
            .await?
            .ok_or(EngineError::JobNotFound(id))?;
        self.jobs.load([job.clone()]);
        Ok(job)
    }

    /// Track jobs read outside `load_instance` (job acquisition).
    pub(crate) fn track_jobs(&mut self, jobs: Vec<Job>) {
        self.jobs.load(jobs);
    }

    // ── Working set access ──

    pub fn execution(&self, id: ExecutionId) -> Option<&Execution> {
        self.tree.get(id)
    }

    pub(crate) fn require_execution(&self, id: ExecutionId) -> Result<&Execution, EngineError> {
        self.tree.get(id).ok_or(EngineError::ExecutionNotFound(id))
    }

    pub(crate) fn require_execution_mut(
        &mut self,
        id: ExecutionId,
    ) -> Result<&mut Execution, EngineError> {
        self.tree.get_mut(id).ok_or(EngineError::ExecutionNotFound(id))
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub(crate) fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Variable lookup along the parent chain.
    pub fn variable(&self, execution: ExecutionId, name: &str) -> Option<&Value> {
        self.tree.variable(execution, name)
    }

    pub fn visible_variables(&self, execution: ExecutionId) -> Variables {
        self.tree.visible_variables(execution)
    }

    /// Write variables into the nearest frame and record the update.
    pub fn set_variables(
        &mut self,
        execution: ExecutionId,
        vars: Variables,
    ) -> Result<(), EngineError> {
        if vars.is_empty() {
            return Ok(());
        }
        let instance_id = self.require_execution(execution)?.process_instance_id;
        let names: Vec<String> = vars.keys().cloned().collect();
        let owner = self
            .tree
            .set_variables(execution, vars)
            .ok_or_else(|| EngineError::invalid_state(execution, "no variable frame"))?;
        self.record(
            instance_id,
            RuntimeEvent::VariablesUpdated {
                execution_id: owner,
                names,
            },
        );
        Ok(())
    }

    pub(crate) fn definition_of(
        &self,
        execution: &Execution,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.services
            .repository
            .get(&execution.definition_id)
            .ok_or_else(|| EngineError::definition_not_found(&execution.definition_id))
    }

    // ── Ids ──

    pub async fn next_id(&self) -> Result<u64, EngineError> {
        Ok(self.services.ids.next_id().await?)
    }

    // ── Jobs ──

    /// Create a pending job bound to `execution_id`, due at `due_at`.
    pub async fn create_job(
        &mut self,
        execution_id: ExecutionId,
        job_type: &str,
        configuration: impl Into<String>,
        due_at: Timestamp,
        exclusive: bool,
    ) -> Result<JobId, EngineError> {
        let configuration = configuration.into();
        let instance_id = self.require_execution(execution_id)?.process_instance_id;
        let id = JobId(self.next_id().await?);
        let job = Job {
            id,
            job_type: job_type.to_string(),
            configuration,
            execution_id,
            process_instance_id: instance_id,
            due_at,
            lock_owner: None,
            lock_expires_at: None,
            retries: self.services.config.job_executor.default_retries,
            exclusive,
            state: JobState::Pending,
            exception_message: None,
            revision: 0,
        };
        self.jobs.insert(job);
        self.record(
            instance_id,
            RuntimeEvent::JobCreated {
                job_id: id,
                job_type: job_type.to_string(),
                execution_id,
                due_at,
            },
        );
        tracing::debug!(job_id = %id, job_type, due_at, "Created job");

        let services = self.services.clone();
        self.on_commit(Box::new(move || services.job_notify.notify_one()));
        Ok(id)
    }

    /// Delete a job from the working set. Returns false if it was not present.
    pub fn delete_job(&mut self, id: JobId) -> bool {
        self.jobs.remove(id).is_some()
    }

    pub(crate) fn delete_jobs_of(&mut self, execution_id: ExecutionId) {
        for id in self.jobs.for_execution(execution_id) {
            self.jobs.remove(id);
        }
    }

    /// Require that `job` is unchanged at commit even though it is not written.
    pub(crate) fn verify_job(&mut self, id: JobId, revision: u32) {
        self.verified_jobs.push((id, revision));
    }

    // ── Events, hooks, agenda ──

    pub fn record(&mut self, instance_id: ExecutionId, event: RuntimeEvent) {
        tracing::trace!(instance_id = %instance_id, event = event.kind(), "Event recorded");
        self.events.push((instance_id, event));
    }

    pub fn on_commit(&mut self, hook: PostCommitHook) {
        self.post_commit.push(hook);
    }

    pub fn push(&mut self, op: Operation) {
        self.agenda.push(op);
    }

    /// Dispatch operations until the agenda is empty.
    pub(crate) async fn drain_agenda(&mut self) -> Result<(), EngineError> {
        while let Some(op) = self.agenda.next()? {
            tracing::trace!(?op, "Agenda");
            self.dispatch(op).await?;
        }
        if self.agenda.dispatched() > 0 {
            tracing::debug!(operations = self.agenda.dispatched(), "Agenda drained");
        }
        Ok(())
    }

    /// Consume the context into its change set and deferred hooks.
    pub(crate) fn into_changes(self) -> (ChangeSet, Vec<PostCommitHook>) {
        let mut changes = ChangeSet::default();
        collect_changes(&self.tree, &self.jobs, &mut changes);
        changes.verified_jobs = self.verified_jobs;
        changes.events = self.events;
        (changes, self.post_commit)
    }
}
