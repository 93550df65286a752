use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::StoreError;
use crate::events::RuntimeEvent;
use crate::idgen::IdBlock;
use crate::store::{ChangeSet, ProcessStore};
use crate::types::*;

#[derive(Default)]
struct Tables {
    executions: BTreeMap<ExecutionId, Execution>,
    jobs: BTreeMap<JobId, Job>,
    events: BTreeMap<ExecutionId, Vec<(u64, RuntimeEvent)>>,
    next_seq: u64,
}

/// In-memory `ProcessStore` for tests and single-node use.
///
/// One `RwLock` over all tables makes `commit` atomic; revisions are checked
/// before anything is applied. The id counter lives outside that lock so id
/// reservation never queues behind commits.
pub struct MemoryStore {
    inner: RwLock<Tables>,
    id_counter: AtomicU64,
    injected_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
            id_counter: AtomicU64::new(1),
            injected_conflicts: AtomicU32::new(0),
        }
    }

    /// Make the next `n` commits fail with a write conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn execution_count(&self) -> usize {
        self.inner.read().map(|t| t.executions.len()).unwrap_or(0)
    }

    pub fn job_count(&self) -> usize {
        self.inner.read().map(|t| t.jobs.len()).unwrap_or(0)
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn conflict(entity: String) -> StoreError {
    StoreError::Conflict { entity }
}

fn check_changes(t: &Tables, changes: &ChangeSet) -> Result<(), StoreError> {
    for e in &changes.inserted_executions {
        if t.executions.contains_key(&e.id) {
            return Err(conflict(format!("execution {}", e.id)));
        }
    }
    for e in &changes.updated_executions {
        match t.executions.get(&e.id) {
            Some(current) if current.revision == e.revision => {}
            _ => return Err(conflict(format!("execution {}", e.id))),
        }
    }
    for (id, revision) in &changes.deleted_executions {
        match t.executions.get(id) {
            Some(current) if current.revision == *revision => {}
            _ => return Err(conflict(format!("execution {id}"))),
        }
    }
    for j in &changes.inserted_jobs {
        if t.jobs.contains_key(&j.id) {
            return Err(conflict(format!("job {}", j.id)));
        }
    }
    for j in &changes.updated_jobs {
        match t.jobs.get(&j.id) {
            Some(current) if current.revision == j.revision => {}
            _ => return Err(conflict(format!("job {}", j.id))),
        }
    }
    for (id, revision) in changes.deleted_jobs.iter().chain(&changes.verified_jobs) {
        match t.jobs.get(id) {
            Some(current) if current.revision == *revision => {}
            _ => return Err(conflict(format!("job {id}"))),
        }
    }
    Ok(())
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn load_execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        let t = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(t.executions.get(&id).cloned())
    }

    async fn load_executions(
        &self,
        instance_id: ExecutionId,
    ) -> Result<Vec<Execution>, StoreError> {
        let t = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(t.executions
            .values()
            .filter(|e| e.process_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let t = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(t.jobs.get(&id).cloned())
    }

    async fn load_jobs_for_instance(
        &self,
        instance_id: ExecutionId,
    ) -> Result<Vec<Job>, StoreError> {
        let t = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(t.jobs
            .values()
            .filter(|j| j.process_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn find_acquirable_jobs(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let t = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut due: Vec<Job> = t
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.due_at, j.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn find_failed_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let t = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(t.jobs
            .values()
            .filter(|j| j.state == JobState::Failed)
            .cloned()
            .collect())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if self.take_injected_conflict() {
            return Err(conflict("injected".to_string()));
        }

        let mut t = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        check_changes(&t, &changes)?;

        for mut e in changes.inserted_executions {
            e.revision = 1;
            t.executions.insert(e.id, e);
        }
        for mut e in changes.updated_executions {
            e.revision += 1;
            t.executions.insert(e.id, e);
        }
        for (id, _) in changes.deleted_executions {
            t.executions.remove(&id);
        }
        for mut j in changes.inserted_jobs {
            j.revision = 1;
            t.jobs.insert(j.id, j);
        }
        for mut j in changes.updated_jobs {
            j.revision += 1;
            t.jobs.insert(j.id, j);
        }
        for (id, _) in changes.deleted_jobs {
            t.jobs.remove(&id);
        }
        for (instance_id, event) in changes.events {
            t.next_seq += 1;
            let seq = t.next_seq;
            t.events.entry(instance_id).or_default().push((seq, event));
        }
        Ok(())
    }

    async fn reserve_id_block(&self, size: u64) -> Result<IdBlock, StoreError> {
        if size == 0 {
            return Err(StoreError::Backend(anyhow!("id block size must be positive")));
        }
        let first = self.id_counter.fetch_add(size, Ordering::SeqCst);
        Ok(IdBlock::new(first, size))
    }

    async fn read_events(
        &self,
        instance_id: ExecutionId,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>, StoreError> {
        let t = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(t.events
            .get(&instance_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DefinitionId;

    fn execution(id: u64) -> Execution {
        Execution::new_root(
            ExecutionId(id),
            DefinitionId::new("p", 1),
            "start".into(),
            Variables::new(),
        )
    }

    #[tokio::test]
    async fn test_commit_assigns_and_checks_revisions() {
        let store = MemoryStore::new();
        store
            .commit(ChangeSet {
                inserted_executions: vec![execution(1)],
                ..Default::default()
            })
            .await
            .unwrap();
        let loaded = store.load_execution(ExecutionId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.revision, 1);

        // First writer wins.
        let mut a = loaded.clone();
        a.is_active = false;
        store
            .commit(ChangeSet {
                updated_executions: vec![a],
                ..Default::default()
            })
            .await
            .unwrap();

        let stale = loaded;
        let err = store
            .commit(ChangeSet {
                updated_executions: vec![stale],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(
            store.load_execution(ExecutionId(1)).await.unwrap().unwrap().revision,
            2
        );
    }

    #[tokio::test]
    async fn test_conflicting_change_set_applies_nothing() {
        let store = MemoryStore::new();
        store
            .commit(ChangeSet {
                inserted_executions: vec![execution(1)],
                ..Default::default()
            })
            .await
            .unwrap();

        let err = store
            .commit(ChangeSet {
                inserted_executions: vec![execution(2)],
                deleted_executions: vec![(ExecutionId(1), 99)],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.load_execution(ExecutionId(2)).await.unwrap().is_none());
        assert!(store.load_execution(ExecutionId(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_id_blocks_do_not_overlap() {
        let store = MemoryStore::new();
        let a = store.reserve_id_block(10).await.unwrap();
        let b = store.reserve_id_block(10).await.unwrap();
        assert_eq!((a.next, a.last), (1, 10));
        assert_eq!((b.next, b.last), (11, 20));
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = MemoryStore::new();
        store.inject_conflicts(1);
        assert!(store.commit(ChangeSet::default()).await.is_err());
        assert!(store.commit(ChangeSet::default()).await.is_ok());
    }
}
