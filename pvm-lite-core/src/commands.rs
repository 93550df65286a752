//! Built-in commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::pipeline::Command;
use crate::repository::DefinitionRef;
use crate::types::*;

// ── Instances ──

/// Start a new instance and run it until it parks or completes.
#[derive(Debug, Clone)]
pub struct StartProcessInstance {
    pub definition: DefinitionRef,
    pub variables: Variables,
}

impl StartProcessInstance {
    pub fn new(definition: impl Into<DefinitionRef>) -> Self {
        Self {
            definition: definition.into(),
            variables: Variables::new(),
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

#[async_trait]
impl Command for StartProcessInstance {
    type Output = ExecutionId;

    fn name(&self) -> &'static str {
        "StartProcessInstance"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<ExecutionId, EngineError> {
        let definition = cx.services().repository.resolve(&self.definition)?;
        cx.start_instance(&definition, self.variables.clone()).await
    }
}

/// Resume a parked execution.
#[derive(Debug, Clone)]
pub struct SignalExecution {
    pub execution_id: ExecutionId,
    pub signal: Option<String>,
    pub payload: Variables,
}

impl SignalExecution {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            signal: None,
            payload: Variables::new(),
        }
    }

    pub fn named(mut self, signal: impl Into<String>) -> Self {
        self.signal = Some(signal.into());
        self
    }

    pub fn with_payload(mut self, payload: Variables) -> Self {
        self.payload = payload;
        self
    }
}

#[async_trait]
impl Command for SignalExecution {
    type Output = ();

    fn name(&self) -> &'static str {
        "SignalExecution"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<(), EngineError> {
        cx.signal_execution(
            self.execution_id,
            self.signal.as_deref(),
            self.payload.clone(),
        )
        .await
    }
}

/// Write variables into the nearest frame of an execution without moving it.
#[derive(Debug, Clone)]
pub struct SetVariables {
    pub execution_id: ExecutionId,
    pub variables: Variables,
}

#[async_trait]
impl Command for SetVariables {
    type Output = ();

    fn name(&self) -> &'static str {
        "SetVariables"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<(), EngineError> {
        cx.load_execution(self.execution_id).await?;
        cx.set_variables(self.execution_id, self.variables.clone())
    }
}

#[derive(Debug, Clone)]
pub struct DeleteProcessInstance {
    pub instance_id: ExecutionId,
    pub reason: String,
}

#[async_trait]
impl Command for DeleteProcessInstance {
    type Output = ();

    fn name(&self) -> &'static str {
        "DeleteProcessInstance"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<(), EngineError> {
        cx.load_execution(self.instance_id).await?;
        cx.delete_instance(self.instance_id, &self.reason)
    }
}

// ── Jobs ──

/// Jobs locked together. An exclusive batch holds every due exclusive job of
/// one process instance and must run sequentially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBatch {
    pub process_instance_id: ExecutionId,
    pub exclusive: bool,
    pub jobs: Vec<JobId>,
}

/// Lock due jobs for `owner` for `lease_ms`.
#[derive(Debug, Clone)]
pub struct AcquireJobs {
    pub owner: String,
    /// Checked before each batch. An exclusive batch is never split, so the
    /// last batch may take the total past the limit.
    pub limit: usize,
    pub lease_ms: i64,
}

fn lock_job(cx: &mut CommandContext, id: JobId, owner: &str, expires_at: Timestamp) -> bool {
    match cx.job_mut(id) {
        Some(job) => {
            job.lock_owner = Some(owner.to_string());
            job.lock_expires_at = Some(expires_at);
            job.state = JobState::Locked;
            true
        }
        None => false,
    }
}

#[async_trait]
impl Command for AcquireJobs {
    type Output = Vec<JobBatch>;

    fn name(&self) -> &'static str {
        "AcquireJobs"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<Vec<JobBatch>, EngineError> {
        let now = cx.now();
        let expires_at = now.saturating_add(self.lease_ms);
        let store = cx.services().store.clone();
        let candidates = store.find_acquirable_jobs(now, self.limit).await?;

        let mut batches = Vec::new();
        let mut acquired = 0;
        let mut seen_instances = HashSet::new();

        for candidate in candidates {
            if acquired >= self.limit {
                break;
            }

            if !candidate.exclusive {
                let id = candidate.id;
                let instance = candidate.process_instance_id;
                cx.track_jobs(vec![candidate]);
                if lock_job(cx, id, &self.owner, expires_at) {
                    batches.push(JobBatch {
                        process_instance_id: instance,
                        exclusive: false,
                        jobs: vec![id],
                    });
                    acquired += 1;
                }
                continue;
            }

            let instance = candidate.process_instance_id;
            if !seen_instances.insert(instance) {
                continue;
            }

            let instance_jobs = store.load_jobs_for_instance(instance).await?;
            if instance_jobs
                .iter()
                .any(|j| j.exclusive && j.lock_is_live(now))
            {
                tracing::debug!(instance_id = %instance, "Exclusive jobs held elsewhere, skipping instance");
                continue;
            }

            let mut due: Vec<(Timestamp, JobId)> = Vec::new();
            for job in instance_jobs.iter().filter(|j| j.exclusive) {
                if job.is_acquirable(now) {
                    due.push((job.due_at, job.id));
                } else {
                    cx.verify_job(job.id, job.revision);
                }
            }
            due.sort();
            cx.track_jobs(instance_jobs);

            let mut jobs = Vec::with_capacity(due.len());
            for (_, id) in due {
                if lock_job(cx, id, &self.owner, expires_at) {
                    jobs.push(id);
                }
            }
            if !jobs.is_empty() {
                acquired += jobs.len();
                batches.push(JobBatch {
                    process_instance_id: instance,
                    exclusive: true,
                    jobs,
                });
            }
        }

        if acquired > 0 {
            tracing::debug!(owner = %self.owner, jobs = acquired, batches = batches.len(), "Acquired jobs");
        }
        Ok(batches)
    }
}

/// Run a locked job's handler and delete the job in the same unit of work.
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    pub job_id: JobId,
    pub owner: String,
}

#[async_trait]
impl Command for ExecuteJob {
    type Output = ();

    fn name(&self) -> &'static str {
        "ExecuteJob"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<(), EngineError> {
        let job = cx.load_job(self.job_id).await?;
        if !job.is_locked_by(&self.owner, cx.now()) {
            return Err(EngineError::LockLost {
                job: job.id,
                owner: self.owner.clone(),
            });
        }
        let handler = cx
            .services()
            .job_handlers
            .get(&job.job_type)
            .ok_or_else(|| EngineError::UnknownJobType(job.job_type.clone()))?;

        cx.load_instance(job.process_instance_id).await?;
        cx.delete_job(job.id);
        cx.record(
            job.process_instance_id,
            RuntimeEvent::JobCompleted {
                job_id: job.id,
                job_type: job.job_type.clone(),
            },
        );

        handler.execute(&job, cx).await.map_err(|e| {
            EngineError::from_extension(e, |source| EngineError::Handler {
                job_type: job.job_type.clone(),
                source,
            })
        })?;
        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Job executed");
        Ok(())
    }
}

/// What happened to a job after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Pending again, due at `due_at`.
    Retrying { retries_left: u32, due_at: Timestamp },
    /// Out of retries; kept as `Failed`.
    Exhausted,
    /// The job no longer exists.
    Gone,
}

/// Book a failed run: one retry less, back off or park as failed.
#[derive(Debug, Clone)]
pub struct RecordJobFailure {
    pub job_id: JobId,
    pub owner: String,
    pub message: String,
}

#[async_trait]
impl Command for RecordJobFailure {
    type Output = FailureOutcome;

    fn name(&self) -> &'static str {
        "RecordJobFailure"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<FailureOutcome, EngineError> {
        let job = match cx.load_job(self.job_id).await {
            Ok(job) => job,
            Err(EngineError::JobNotFound(_)) => return Ok(FailureOutcome::Gone),
            Err(e) => return Err(e),
        };
        if job.lock_owner.as_deref() != Some(self.owner.as_str()) {
            return Err(EngineError::LockLost {
                job: job.id,
                owner: self.owner.clone(),
            });
        }

        let now = cx.now();
        let backoff = cx.config().job_executor.retry_backoff_ms;
        let Some(row) = cx.job_mut(job.id) else {
            return Ok(FailureOutcome::Gone);
        };
        row.retries = row.retries.saturating_sub(1);
        row.exception_message = Some(self.message.clone());
        row.lock_owner = None;
        row.lock_expires_at = None;

        let outcome = if row.retries == 0 {
            row.state = JobState::Failed;
            FailureOutcome::Exhausted
        } else {
            row.state = JobState::Pending;
            row.due_at = now.saturating_add(backoff);
            FailureOutcome::Retrying {
                retries_left: row.retries,
                due_at: row.due_at,
            }
        };

        match outcome {
            FailureOutcome::Exhausted => {
                tracing::warn!(job_id = %job.id, job_type = %job.job_type, error = %self.message, "Job retries exhausted");
                cx.record(
                    job.process_instance_id,
                    RuntimeEvent::JobRetriesExhausted {
                        job_id: job.id,
                        message: self.message.clone(),
                    },
                );
            }
            FailureOutcome::Retrying { retries_left, .. } => {
                tracing::warn!(job_id = %job.id, job_type = %job.job_type, retries_left, error = %self.message, "Job failed, will retry");
                cx.record(
                    job.process_instance_id,
                    RuntimeEvent::JobFailed {
                        job_id: job.id,
                        retries_left,
                        message: self.message.clone(),
                    },
                );
            }
            FailureOutcome::Gone => {}
        }
        Ok(outcome)
    }
}

/// Operator intervention: reset a job's retries. A failed job with retries
/// left becomes due immediately.
#[derive(Debug, Clone)]
pub struct SetJobRetries {
    pub job_id: JobId,
    pub retries: u32,
}

#[async_trait]
impl Command for SetJobRetries {
    type Output = ();

    fn name(&self) -> &'static str {
        "SetJobRetries"
    }

    async fn execute(&self, cx: &mut CommandContext) -> Result<(), EngineError> {
        cx.load_job(self.job_id).await?;
        let now = cx.now();
        let row = cx
            .job_mut(self.job_id)
            .ok_or(EngineError::JobNotFound(self.job_id))?;
        row.retries = self.retries;
        let revived = row.state == JobState::Failed && self.retries > 0;
        if revived {
            row.state = JobState::Pending;
            row.due_at = now;
            row.exception_message = None;
            row.lock_owner = None;
            row.lock_expires_at = None;
        }
        if revived {
            let services = cx.services().clone();
            cx.on_commit(Box::new(move || services.job_notify.notify_one()));
        }
        tracing::info!(job_id = %self.job_id, retries = self.retries, revived, "Job retries set");
        Ok(())
    }
}
