//! Typed error model for the engine.
//!
//! - `GraphError`: a malformed graph, raised by the builder and at deploy time.
//! - `StoreError`: the persistence provider's contract (write conflicts are
//!   distinguishable from backend failures).
//! - `EngineError`: everything a caller of `ProcessEngine::execute` can see.
//!
//! Extension points (job handlers, custom behaviors) return `anyhow::Result`;
//! their errors are wrapped, or passed through unchanged when they already
//! carry an `EngineError`.

use crate::authoring::validate::ValidationIssue;
use crate::repository::DefinitionId;
use crate::types::{ExecutionId, JobId};

// ---------------------------------------------------------------------------
// GraphError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("process graph '{key}' has no activities")]
    Empty { key: String },

    #[error("duplicate activity id: {0}")]
    DuplicateActivity(String),

    #[error("transition {source_id} → {destination}: unknown activity '{missing}'")]
    UnknownActivity {
        source_id: String,
        destination: String,
        missing: String,
    },

    #[error("initial activity '{0}' is not declared")]
    UnknownInitial(String),

    #[error("activity '{activity}': enclosing scope '{scope}' is missing or not scope-introducing")]
    InvalidScope { activity: String, scope: String },

    /// A YAML definition could not be parsed.
    #[error("definition parse error: {0}")]
    Parse(String),

    /// The graph could not be encoded for digesting.
    #[error("graph encoding failed: {0}")]
    Encoding(String),
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic-lock failure: a row changed since it was read.
    #[error("write conflict on {entity}")]
    Conflict { entity: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Deployment rejected by validation.
    #[error("definition '{key}' failed validation: {}", render_issues(.issues))]
    Validation {
        key: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("activity '{activity}' has no outgoing transition {transition}")]
    NoSuchTransition {
        activity: String,
        transition: String,
    },

    #[error("execution {execution} is in an invalid state: {reason}")]
    InvalidState {
        execution: ExecutionId,
        reason: String,
    },

    #[error("decision '{activity}': no condition matched and no default transition")]
    NoApplicableTransition { activity: String },

    /// Runaway graph. Never retried.
    #[error("agenda limit of {limit} operations exceeded")]
    AgendaLimitExceeded { limit: usize },

    /// Concurrent modification detected at commit time.
    #[error("write conflict on {entity} after {attempts} attempt(s)")]
    WriteConflict { entity: String, attempts: u32 },

    /// The caller no longer holds the lease on this job.
    #[error("lock on job {job} is no longer held by {owner}")]
    LockLost { job: JobId, owner: String },

    #[error("no job handler registered for type '{0}'")]
    UnknownJobType(String),

    #[error("no behavior registered under '{0}'")]
    UnknownBehavior(String),

    #[error("behavior of activity '{activity}' failed: {source}")]
    Behavior {
        activity: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("job handler '{job_type}' failed: {source}")]
    Handler {
        job_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    /// Only write conflicts are recovered by re-running the command.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WriteConflict { .. })
    }

    /// Pass an `EngineError` raised inside extension code through unchanged,
    /// wrap anything else with `wrap`.
    pub(crate) fn from_extension(
        err: anyhow::Error,
        wrap: impl FnOnce(anyhow::Error) -> EngineError,
    ) -> EngineError {
        match err.downcast::<EngineError>() {
            Ok(engine_err) => engine_err,
            Err(other) => wrap(other),
        }
    }

    pub(crate) fn invalid_state(execution: ExecutionId, reason: impl Into<String>) -> Self {
        EngineError::InvalidState {
            execution,
            reason: reason.into(),
        }
    }

    pub(crate) fn definition_not_found(id: &DefinitionId) -> Self {
        EngineError::DefinitionNotFound(id.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { entity } => EngineError::WriteConflict {
                entity,
                attempts: 1,
            },
            other => EngineError::Store(other),
        }
    }
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
