//! Unit-of-work working set.
//!
//! Rows loaded from the store are kept twice: the snapshot as read, and the
//! current (mutable) copy. At commit the two are diffed into a [`ChangeSet`];
//! updates and deletes carry the snapshot's revision.

use std::collections::{BTreeMap, BTreeSet};

use crate::store::ChangeSet;
use crate::types::*;

/// A persisted, revision-checked row.
pub trait Row: Clone + PartialEq {
    type Id: Copy + Ord + std::fmt::Debug;

    fn row_id(&self) -> Self::Id;
    fn row_revision(&self) -> u32;
}

impl Row for Execution {
    type Id = ExecutionId;

    fn row_id(&self) -> ExecutionId {
        self.id
    }

    fn row_revision(&self) -> u32 {
        self.revision
    }
}

impl Row for Job {
    type Id = JobId;

    fn row_id(&self) -> JobId {
        self.id
    }

    fn row_revision(&self) -> u32 {
        self.revision
    }
}

/// Rows diffed against the state they were loaded in.
#[derive(Debug)]
pub struct WorkingSet<T: Row> {
    loaded: BTreeMap<T::Id, T>,
    current: BTreeMap<T::Id, T>,
    touched: BTreeSet<T::Id>,
}

impl<T: Row> Default for WorkingSet<T> {
    fn default() -> Self {
        Self {
            loaded: BTreeMap::new(),
            current: BTreeMap::new(),
            touched: BTreeSet::new(),
        }
    }
}

/// Inserted, updated and deleted rows of one working set.
pub struct Diff<T: Row> {
    pub inserted: Vec<T>,
    pub updated: Vec<T>,
    pub deleted: Vec<(T::Id, u32)>,
}

impl<T: Row> WorkingSet<T> {
    /// Track rows read from the store. Rows already tracked keep their
    /// in-flight state.
    pub fn load(&mut self, rows: impl IntoIterator<Item = T>) {
        for row in rows {
            let id = row.row_id();
            if self.loaded.contains_key(&id) || self.current.contains_key(&id) {
                continue;
            }
            self.loaded.insert(id, row.clone());
            self.current.insert(id, row);
        }
    }

    pub fn is_loaded(&self, id: T::Id) -> bool {
        self.loaded.contains_key(&id)
    }

    pub fn get(&self, id: T::Id) -> Option<&T> {
        self.current.get(&id)
    }

    pub fn get_mut(&mut self, id: T::Id) -> Option<&mut T> {
        self.current.get_mut(&id)
    }

    pub fn insert(&mut self, row: T) {
        self.current.insert(row.row_id(), row);
    }

    pub fn remove(&mut self, id: T::Id) -> Option<T> {
        self.current.remove(&id)
    }

    /// Write `id` back at commit even when unchanged, so its revision check
    /// orders this unit of work against any other that also touches it.
    pub fn touch(&mut self, id: T::Id) {
        self.touched.insert(id);
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.current.values()
    }

    pub fn diff(&self) -> Diff<T> {
        let mut diff = Diff {
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        };
        for (id, row) in &self.current {
            match self.loaded.get(id) {
                None => diff.inserted.push(row.clone()),
                Some(original) if original != row || self.touched.contains(id) => {
                    diff.updated.push(row.clone())
                }
                Some(_) => {}
            }
        }
        for (id, original) in &self.loaded {
            if !self.current.contains_key(id) {
                diff.deleted.push((*id, original.row_revision()));
            }
        }
        diff
    }
}

// ── Execution tree ──

/// The execution tree of the instances touched by a unit of work.
pub type ExecutionTree = WorkingSet<Execution>;

impl WorkingSet<Execution> {
    /// Direct children, ordered by id.
    pub fn children(&self, parent: ExecutionId) -> Vec<ExecutionId> {
        self.current
            .values()
            .filter(|e| e.parent == Some(parent))
            .map(|e| e.id)
            .collect()
    }

    pub fn concurrent_children(&self, parent: ExecutionId) -> Vec<ExecutionId> {
        self.current
            .values()
            .filter(|e| e.parent == Some(parent) && e.is_concurrent)
            .map(|e| e.id)
            .collect()
    }

    /// All descendants of `id`, deepest first.
    pub fn descendants(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        let mut stack = self.children(id);
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next));
        }
        out.reverse();
        out
    }

    pub fn instance_members(&self, instance_id: ExecutionId) -> Vec<ExecutionId> {
        self.current
            .values()
            .filter(|e| e.process_instance_id == instance_id)
            .map(|e| e.id)
            .collect()
    }

    /// Nearest execution on the parent chain that owns a variable frame.
    pub fn frame_owner(&self, id: ExecutionId) -> Option<ExecutionId> {
        let mut cursor = self.current.get(&id);
        while let Some(execution) = cursor {
            if execution.variables.is_some() {
                return Some(execution.id);
            }
            cursor = execution.parent.and_then(|p| self.current.get(&p));
        }
        None
    }

    /// Resolve a variable by walking the parent chain.
    pub fn variable(&self, id: ExecutionId, name: &str) -> Option<&Value> {
        let mut cursor = self.current.get(&id);
        while let Some(execution) = cursor {
            if let Some(value) = execution.variables.as_ref().and_then(|v| v.get(name)) {
                return Some(value);
            }
            cursor = execution.parent.and_then(|p| self.current.get(&p));
        }
        None
    }

    /// Every variable visible from `id`; inner frames shadow outer ones.
    pub fn visible_variables(&self, id: ExecutionId) -> Variables {
        let mut chain = Vec::new();
        let mut cursor = self.current.get(&id);
        while let Some(execution) = cursor {
            chain.push(execution);
            cursor = execution.parent.and_then(|p| self.current.get(&p));
        }
        let mut out = Variables::new();
        for execution in chain.into_iter().rev() {
            if let Some(frame) = &execution.variables {
                out.extend(frame.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        out
    }

    /// Write into the nearest frame. Returns the frame owner.
    pub fn set_variables(&mut self, id: ExecutionId, vars: Variables) -> Option<ExecutionId> {
        let owner = self.frame_owner(id)?;
        let frame = self.current.get_mut(&owner)?.variables.as_mut()?;
        frame.extend(vars);
        Some(owner)
    }
}

// ── Jobs ──

pub type JobSet = WorkingSet<Job>;

impl WorkingSet<Job> {
    pub fn for_execution(&self, execution_id: ExecutionId) -> Vec<JobId> {
        self.current
            .values()
            .filter(|j| j.execution_id == execution_id)
            .map(|j| j.id)
            .collect()
    }

    pub fn for_instance(&self, instance_id: ExecutionId) -> Vec<JobId> {
        self.current
            .values()
            .filter(|j| j.process_instance_id == instance_id)
            .map(|j| j.id)
            .collect()
    }
}

/// Fold both working sets into one change set.
pub fn collect_changes(
    tree: &ExecutionTree,
    jobs: &JobSet,
    changes: &mut ChangeSet,
) {
    let executions = tree.diff();
    changes.inserted_executions = executions.inserted;
    changes.updated_executions = executions.updated;
    changes.deleted_executions = executions.deleted;

    let jobs = jobs.diff();
    changes.inserted_jobs = jobs.inserted;
    changes.updated_jobs = jobs.updated;
    changes.deleted_jobs = jobs.deleted;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DefinitionId;

    fn root(id: u64) -> Execution {
        Execution::new_root(
            ExecutionId(id),
            DefinitionId::new("p", 1),
            "start".into(),
            Variables::from([("rating".to_string(), Value::from("AAA+"))]),
        )
    }

    #[test]
    fn test_diff_classifies_rows() {
        let mut tree = ExecutionTree::default();
        let mut loaded = root(1);
        loaded.revision = 4;
        let untouched = Execution::new_concurrent_child(ExecutionId(2), &loaded);
        tree.load([loaded.clone(), untouched.clone()]);

        tree.get_mut(ExecutionId(1)).unwrap().is_active = false;
        tree.insert(Execution::new_concurrent_child(ExecutionId(3), &loaded));
        tree.remove(ExecutionId(2));

        let diff = tree.diff();
        assert_eq!(diff.inserted.len(), 1);
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].revision, 4);
        assert_eq!(diff.deleted, vec![(ExecutionId(2), 0)]);
    }

    #[test]
    fn test_unchanged_rows_produce_no_writes() {
        let mut tree = ExecutionTree::default();
        tree.load([root(1)]);
        let diff = tree.diff();
        assert!(diff.inserted.is_empty() && diff.updated.is_empty() && diff.deleted.is_empty());
    }

    #[test]
    fn test_touched_rows_are_written_with_their_read_revision() {
        let mut tree = ExecutionTree::default();
        let mut scope = root(1);
        scope.revision = 3;
        tree.load([scope]);
        tree.touch(ExecutionId(1));
        tree.touch(ExecutionId(9));

        let diff = tree.diff();
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].revision, 3);
        assert!(diff.inserted.is_empty() && diff.deleted.is_empty());
    }

    #[test]
    fn test_variables_resolve_through_parent_chain() {
        let mut tree = ExecutionTree::default();
        let parent = root(1);
        let mut child = Execution::new_concurrent_child(ExecutionId(2), &parent);
        child.variables = Some(Variables::from([("rating".to_string(), Value::from("BB"))]));
        let grandchild = Execution::new_concurrent_child(ExecutionId(3), &child);
        tree.insert(parent);
        tree.insert(child);
        tree.insert(grandchild);

        assert_eq!(tree.variable(ExecutionId(3), "rating"), Some(&Value::from("BB")));
        assert_eq!(tree.variable(ExecutionId(1), "rating"), Some(&Value::from("AAA+")));
        assert_eq!(tree.frame_owner(ExecutionId(3)), Some(ExecutionId(2)));
        assert_eq!(tree.descendants(ExecutionId(1)), vec![ExecutionId(3), ExecutionId(2)]);
    }
}
