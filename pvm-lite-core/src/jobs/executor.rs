//! JobExecutor: the polling actor that drives due jobs.
//!
//! Each cycle locks a batch of due jobs through `AcquireJobs`, then runs each
//! acquired batch on its own task, bounded by `max_concurrent`. Between cycles
//! it sleeps `poll_interval_ms`, waking early when a commit creates a job.
//! Failed runs are booked through `RecordJobFailure` in a separate unit of
//! work.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::commands::{AcquireJobs, ExecuteJob, FailureOutcome, JobBatch, RecordJobFailure};
use crate::config::JobExecutorConfig;
use crate::engine::ProcessEngine;
use crate::error::EngineError;

pub struct JobExecutor {
    engine: ProcessEngine,
    node_id: String,
    config: JobExecutorConfig,
}

impl JobExecutor {
    pub fn new(engine: ProcessEngine) -> Self {
        let config = engine.config().job_executor.clone();
        let node_id = config.resolved_node_id();
        Self {
            engine,
            node_id,
            config,
        }
    }

    /// Override the lock owner (or use `job_executor.node_id`).
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Lock up to `batch_size` due jobs for this node.
    pub async fn acquire(&self) -> Result<Vec<JobBatch>, EngineError> {
        self.engine
            .execute(&AcquireJobs {
                owner: self.node_id.clone(),
                limit: self.config.batch_size,
                lease_ms: self.config.lease_ms,
            })
            .await
    }

    /// One acquisition cycle, run inline. Returns the number of jobs attempted.
    pub async fn run_once(&self) -> Result<usize, EngineError> {
        let batches = self.acquire().await?;
        let mut attempted = 0;
        for batch in batches {
            attempted += run_batch(&self.engine, &self.node_id, batch).await;
        }
        Ok(attempted)
    }

    /// Run until `shutdown` flips to true (or its sender is dropped), then wait
    /// for in-flight batches.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            node_id = %self.node_id,
            max_concurrent = self.config.max_concurrent,
            "Job executor started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        let services = self.engine.services().clone();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.acquire().await {
                Ok(batches) => {
                    for batch in batches {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        let engine = self.engine.clone();
                        let owner = self.node_id.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            run_batch(&engine, &owner, batch).await
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(node_id = %self.node_id, error = %e, "Job acquisition failed");
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Job batch task panicked");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = services.job_notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.engine.shutdown();
        tracing::info!(
            node_id = %self.node_id,
            in_flight = tasks.len(),
            "Job executor shutting down"
        );
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Job batch task panicked");
            }
        }
        tracing::info!(node_id = %self.node_id, "Job executor stopped");
    }
}

/// Run a batch's jobs in order. Returns the number of jobs attempted.
async fn run_batch(engine: &ProcessEngine, owner: &str, batch: JobBatch) -> usize {
    let mut attempted = 0;
    for job_id in batch.jobs {
        let result = engine
            .execute(&ExecuteJob {
                job_id,
                owner: owner.to_string(),
            })
            .await;

        match result {
            Ok(()) => attempted += 1,
            Err(e @ (EngineError::LockLost { .. } | EngineError::JobNotFound(_))) => {
                tracing::warn!(job_id = %job_id, error = %e, "Job no longer ours, abandoning");
                if batch.exclusive {
                    // The rest of the batch was locked under the same lease.
                    break;
                }
            }
            Err(e) => {
                attempted += 1;
                let failure = RecordJobFailure {
                    job_id,
                    owner: owner.to_string(),
                    message: e.to_string(),
                };
                match engine.execute(&failure).await {
                    Ok(FailureOutcome::Exhausted) => {
                        tracing::error!(job_id = %job_id, "Job failed permanently");
                    }
                    Ok(_) => {}
                    Err(record_err) => {
                        tracing::warn!(job_id = %job_id, error = %record_err, "Could not record job failure");
                    }
                }
            }
        }
    }
    attempted
}
