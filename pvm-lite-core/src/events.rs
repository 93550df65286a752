use serde::{Deserialize, Serialize};

use crate::repository::DefinitionId;
use crate::types::*;

/// Runtime events: the audit trail of a process instance. Recorded in the
/// same commit as the state change they describe, so a rolled-back unit of
/// work leaves no events behind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        definition_id: DefinitionId,
    },
    ActivityEntered {
        execution_id: ExecutionId,
        activity: ActivityId,
    },
    TransitionTaken {
        execution_id: ExecutionId,
        source: ActivityId,
        destination: ActivityId,
        transition: Option<String>,
    },
    Forked {
        scope_id: ExecutionId,
        activity: ActivityId,
        children: Vec<ExecutionId>,
    },
    JoinArrived {
        execution_id: ExecutionId,
        activity: ActivityId,
        arrived: usize,
        expected: usize,
    },
    JoinReleased {
        activity: ActivityId,
        continued_by: ExecutionId,
    },
    Signalled {
        execution_id: ExecutionId,
        activity: ActivityId,
        signal: Option<String>,
    },
    VariablesUpdated {
        execution_id: ExecutionId,
        names: Vec<String>,
    },
    JobCreated {
        job_id: JobId,
        job_type: String,
        execution_id: ExecutionId,
        due_at: Timestamp,
    },
    JobCompleted {
        job_id: JobId,
        job_type: String,
    },
    JobFailed {
        job_id: JobId,
        retries_left: u32,
        message: String,
    },
    JobRetriesExhausted {
        job_id: JobId,
        message: String,
    },
    InstanceCompleted {
        at: Timestamp,
    },
    InstanceDeleted {
        reason: String,
        at: Timestamp,
    },
}

impl RuntimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeEvent::InstanceStarted { .. } => "instance_started",
            RuntimeEvent::ActivityEntered { .. } => "activity_entered",
            RuntimeEvent::TransitionTaken { .. } => "transition_taken",
            RuntimeEvent::Forked { .. } => "forked",
            RuntimeEvent::JoinArrived { .. } => "join_arrived",
            RuntimeEvent::JoinReleased { .. } => "join_released",
            RuntimeEvent::Signalled { .. } => "signalled",
            RuntimeEvent::VariablesUpdated { .. } => "variables_updated",
            RuntimeEvent::JobCreated { .. } => "job_created",
            RuntimeEvent::JobCompleted { .. } => "job_completed",
            RuntimeEvent::JobFailed { .. } => "job_failed",
            RuntimeEvent::JobRetriesExhausted { .. } => "job_retries_exhausted",
            RuntimeEvent::InstanceCompleted { .. } => "instance_completed",
            RuntimeEvent::InstanceDeleted { .. } => "instance_deleted",
        }
    }
}
