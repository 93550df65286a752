use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::repository::DefinitionId;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Activity identifier, unique within one process graph.
pub type ActivityId = String;

/// Local variable frame.
pub type Variables = BTreeMap<String, Value>;

// ─── Entity ids ───────────────────────────────────────────────

/// Identity of an execution. The root execution's id doubles as the
/// process-instance id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u64);

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Value ────────────────────────────────────────────────────

/// A process variable value. Deliberately flat: decisions compare these,
/// they are never interpreted further by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    Str(String),
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::I64(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

// ─── Execution ────────────────────────────────────────────────

/// A runtime cursor positioned on an activity. Executions form a tree per
/// process instance; parent links are ids, never pointers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub process_instance_id: ExecutionId,
    pub parent: Option<ExecutionId>,
    pub definition_id: DefinitionId,
    /// `None` once the execution has ended.
    pub activity: Option<ActivityId>,
    pub is_active: bool,
    pub is_concurrent: bool,
    pub is_scope: bool,
    /// Present only while this execution owns a local frame.
    pub variables: Option<Variables>,
    /// Persisted revision, checked on every write.
    pub revision: u32,
}

impl Execution {
    /// A new root execution (process instance) positioned at `activity`.
    pub fn new_root(
        id: ExecutionId,
        definition_id: DefinitionId,
        activity: ActivityId,
        variables: Variables,
    ) -> Self {
        Self {
            id,
            process_instance_id: id,
            parent: None,
            definition_id,
            activity: Some(activity),
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            variables: Some(variables),
            revision: 0,
        }
    }

    /// A concurrent child of `scope`, positioned where the scope is.
    pub fn new_concurrent_child(id: ExecutionId, scope: &Execution) -> Self {
        Self {
            id,
            process_instance_id: scope.process_instance_id,
            parent: Some(scope.id),
            definition_id: scope.definition_id.clone(),
            activity: scope.activity.clone(),
            is_active: true,
            is_concurrent: true,
            is_scope: false,
            variables: None,
            revision: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_at(&self, activity: &str) -> bool {
        self.activity.as_deref() == Some(activity)
    }
}

// ─── Job ──────────────────────────────────────────────────────

/// Persistent job state. A completed job is deleted, so there is no `Done`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Locked,
    /// Retries exhausted; kept for operator inspection.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A deferred, lockable unit of work bound to an execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Handler discriminator, e.g. `timer-transition`.
    pub job_type: String,
    /// Opaque to the scheduler; interpreted by the handler.
    pub configuration: String,
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    pub due_at: Timestamp,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<Timestamp>,
    pub retries: u32,
    pub exclusive: bool,
    pub state: JobState,
    pub exception_message: Option<String>,
    pub revision: u32,
}

impl Job {
    /// True while some owner holds an unexpired lease.
    pub fn lock_is_live(&self, now: Timestamp) -> bool {
        self.lock_owner.is_some() && self.lock_expires_at.is_some_and(|at| at > now)
    }

    /// Due, not failed, and not held under a live lease.
    pub fn is_acquirable(&self, now: Timestamp) -> bool {
        self.state != JobState::Failed && self.due_at <= now && !self.lock_is_live(now)
    }

    pub fn is_locked_by(&self, owner: &str, now: Timestamp) -> bool {
        self.lock_is_live(now) && self.lock_owner.as_deref() == Some(owner)
    }
}

// ─── Clock ────────────────────────────────────────────────────

/// Time source for due dates and leases.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to. Used to drive timers and lease
/// expiry deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, at: Timestamp) {
        self.now.store(at, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
