use async_trait::async_trait;

use crate::error::StoreError;
use crate::events::RuntimeEvent;
use crate::idgen::IdBlock;
use crate::types::*;

// ── ChangeSet ──

/// Everything one unit of work wants to write, applied atomically by
/// [`ProcessStore::commit`].
///
/// Updates and deletes carry the revision they were read at; the store
/// rejects the whole change set with `StoreError::Conflict` if any row moved
/// on in the meantime. `verified_jobs` are rows that were only read but whose
/// stability the unit of work depends on (exclusive-job acquisition).
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub inserted_executions: Vec<Execution>,
    pub updated_executions: Vec<Execution>,
    pub deleted_executions: Vec<(ExecutionId, u32)>,
    pub inserted_jobs: Vec<Job>,
    pub updated_jobs: Vec<Job>,
    pub deleted_jobs: Vec<(JobId, u32)>,
    pub verified_jobs: Vec<(JobId, u32)>,
    /// `(process_instance_id, event)` in recording order.
    pub events: Vec<(ExecutionId, RuntimeEvent)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted_executions.is_empty()
            && self.updated_executions.is_empty()
            && self.deleted_executions.is_empty()
            && self.inserted_jobs.is_empty()
            && self.updated_jobs.is_empty()
            && self.deleted_jobs.is_empty()
            && self.verified_jobs.is_empty()
            && self.events.is_empty()
    }

    /// Number of row writes, for logging.
    pub fn write_count(&self) -> usize {
        self.inserted_executions.len()
            + self.updated_executions.len()
            + self.deleted_executions.len()
            + self.inserted_jobs.len()
            + self.updated_jobs.len()
            + self.deleted_jobs.len()
    }
}

// ── ProcessStore ──

/// Persistence contract for executions, jobs, id blocks and the event log.
///
/// The engine never writes row-by-row: reads are free-standing, and all
/// writes of a unit of work go through one `commit`. A backend must make
/// `commit` atomic and revision-checked; that is the only concurrency control
/// between commands.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Executions ──

    async fn load_execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError>;
    async fn load_executions(&self, instance_id: ExecutionId)
        -> Result<Vec<Execution>, StoreError>;

    // ── Jobs ──

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;
    async fn load_jobs_for_instance(&self, instance_id: ExecutionId)
        -> Result<Vec<Job>, StoreError>;

    /// Due, non-failed jobs whose lock is absent or expired, ordered by
    /// `(due_at, id)`.
    async fn find_acquirable_jobs(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    async fn find_failed_jobs(&self) -> Result<Vec<Job>, StoreError>;

    // ── Unit of work ──

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;

    // ── Id blocks ──

    /// Atomically reserve `size` ids from the shared counter. Runs outside any
    /// unit of work.
    async fn reserve_id_block(&self, size: u64) -> Result<IdBlock, StoreError>;

    // ── Event log (append-only, written by `commit`) ──

    async fn read_events(
        &self,
        instance_id: ExecutionId,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>, StoreError>;
}
