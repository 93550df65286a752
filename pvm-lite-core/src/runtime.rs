//! Execution-tree advancement: the agenda operations and the built-in
//! behaviors, implemented on the unit-of-work context.

use std::sync::Arc;

use crate::agenda::Operation;
use crate::behavior::BehaviorContext;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::graph::{Activity, Behavior, DecisionRoute};
use crate::jobs::{ASYNC_CONTINUATION, TIMER_TRANSITION};
use crate::repository::ProcessDefinition;
use crate::types::*;

fn lookup<'d>(
    definition: &'d ProcessDefinition,
    activity: &str,
    execution: ExecutionId,
) -> Result<&'d Activity, EngineError> {
    definition.activity(activity).ok_or_else(|| {
        EngineError::invalid_state(
            execution,
            format!("activity '{activity}' is not part of {}", definition.id),
        )
    })
}

/// Scope activities enclosing `activity`, innermost first, including
/// `activity` itself when it introduces a scope.
fn scope_chain<'d>(definition: &'d ProcessDefinition, activity: &'d Activity) -> Vec<&'d str> {
    let mut chain = Vec::new();
    if activity.is_scope {
        chain.push(activity.id.as_str());
    }
    let mut cursor = activity.scope.as_deref();
    // Bounded walk; scope references are validated but may still form a cycle.
    for _ in 0..definition.graph().activities().len() {
        let Some(scope) = cursor else { break };
        if chain.contains(&scope) {
            break;
        }
        chain.push(scope);
        cursor = definition.activity(scope).and_then(|a| a.scope.as_deref());
    }
    chain
}

fn describe_signal(signal: Option<&str>) -> String {
    match signal {
        Some(name) => format!("'{name}'"),
        None => "(default)".to_string(),
    }
}

impl CommandContext {
    pub(crate) async fn dispatch(&mut self, op: Operation) -> Result<(), EngineError> {
        if self.execution(op.execution()).is_none() {
            // Removed earlier in this unit of work, e.g. by an instance end.
            tracing::trace!(?op, "Skipping operation on removed execution");
            return Ok(());
        }
        match op {
            Operation::Enter { execution } => self.enter(execution).await,
            Operation::ExecuteActivity { execution } => self.execute_activity(execution).await,
            Operation::Take {
                execution,
                transition,
            } => self.take(execution, transition),
            Operation::End { execution } => self.end(execution),
        }
    }

    /// Definition and current activity of a live execution.
    fn locate(&self, id: ExecutionId) -> Result<(Arc<ProcessDefinition>, ActivityId), EngineError> {
        let execution = self.require_execution(id)?;
        let activity = execution
            .activity
            .clone()
            .ok_or_else(|| EngineError::invalid_state(id, "execution has ended"))?;
        let definition = self.definition_of(execution)?;
        Ok((definition, activity))
    }

    fn instance_of(&self, id: ExecutionId) -> Result<ExecutionId, EngineError> {
        Ok(self.require_execution(id)?.process_instance_id)
    }

    // ── Instance lifecycle ──

    /// Create the root execution at the initial activity and schedule its
    /// entry. Progress happens when the agenda is drained.
    pub(crate) async fn start_instance(
        &mut self,
        definition: &ProcessDefinition,
        variables: Variables,
    ) -> Result<ExecutionId, EngineError> {
        let id = ExecutionId(self.next_id().await?);
        let initial = definition.graph().initial().id.clone();
        self.tree.insert(Execution::new_root(
            id,
            definition.id.clone(),
            initial,
            variables,
        ));
        self.record(
            id,
            RuntimeEvent::InstanceStarted {
                definition_id: definition.id.clone(),
            },
        );
        self.push(Operation::Enter { execution: id });
        tracing::info!(instance_id = %id, definition = %definition.id, "Process instance started");
        Ok(id)
    }

    fn remove_instance(&mut self, instance_id: ExecutionId) {
        for id in self.tree.instance_members(instance_id) {
            self.tree.remove(id);
        }
        for id in self.jobs.for_instance(instance_id) {
            self.jobs.remove(id);
        }
    }

    fn complete_instance(&mut self, instance_id: ExecutionId) {
        self.remove_instance(instance_id);
        let at = self.now();
        self.record(instance_id, RuntimeEvent::InstanceCompleted { at });
        tracing::info!(instance_id = %instance_id, "Process instance completed");
    }

    /// Remove an instance with all its executions and jobs.
    pub(crate) fn delete_instance(
        &mut self,
        instance_id: ExecutionId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let root = self.require_execution(instance_id)?;
        if !root.is_root() {
            return Err(EngineError::invalid_state(
                instance_id,
                "not a process instance (root execution)",
            ));
        }
        self.remove_instance(instance_id);
        let at = self.now();
        self.record(
            instance_id,
            RuntimeEvent::InstanceDeleted {
                reason: reason.to_string(),
                at,
            },
        );
        tracing::info!(instance_id = %instance_id, reason, "Process instance deleted");
        Ok(())
    }

    // ── Operations ──

    async fn enter(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let (definition, activity_id) = self.locate(id)?;
        let activity = lookup(&definition, &activity_id, id)?;
        let instance_id = self.instance_of(id)?;

        if activity.is_scope || activity.scope.is_some() {
            let execution = self.require_execution_mut(id)?;
            if execution.variables.is_none() {
                execution.variables = Some(Variables::new());
                execution.is_scope = true;
            }
        }

        self.record(
            instance_id,
            RuntimeEvent::ActivityEntered {
                execution_id: id,
                activity: activity_id.clone(),
            },
        );

        if activity.asynchronous {
            self.deactivate(id)?;
            let now = self.now();
            self.create_job(id, ASYNC_CONTINUATION, activity_id, now, activity.exclusive)
                .await?;
        } else {
            self.push(Operation::ExecuteActivity { execution: id });
        }
        Ok(())
    }

    async fn execute_activity(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let (definition, activity_id) = self.locate(id)?;
        let activity = lookup(&definition, &activity_id, id)?;
        tracing::trace!(execution_id = %id, activity = %activity_id, behavior = activity.behavior.tag(), "Execute");

        match &activity.behavior {
            Behavior::Automatic => self.leave(id, activity),
            Behavior::WaitState => self.deactivate(id),
            Behavior::Decision { routes, default } => {
                self.decide(id, activity, routes, default.as_deref())
            }
            Behavior::Fork => self.fork(id, activity).await,
            Behavior::Join => self.join(id, activity),
            Behavior::Timer { duration_ms } => {
                self.deactivate(id)?;
                let delay = i64::try_from(*duration_ms).unwrap_or(i64::MAX);
                let due_at = self.now().saturating_add(delay);
                self.create_job(id, TIMER_TRANSITION, activity_id, due_at, activity.exclusive)
                    .await?;
                Ok(())
            }
            Behavior::Custom { name, config } => {
                let behavior = self
                    .services()
                    .behaviors
                    .get(name)
                    .ok_or_else(|| EngineError::UnknownBehavior(name.clone()))?;
                let mut bcx = BehaviorContext::new(self, id, activity, config);
                behavior.execute(&mut bcx).await.map_err(|e| {
                    EngineError::from_extension(e, |source| EngineError::Behavior {
                        activity: activity_id.clone(),
                        source,
                    })
                })
            }
        }
    }

    fn take(&mut self, id: ExecutionId, index: usize) -> Result<(), EngineError> {
        let (definition, activity_id) = self.locate(id)?;
        let source = lookup(&definition, &activity_id, id)?;
        let transition = source
            .outgoing
            .get(index)
            .ok_or_else(|| EngineError::NoSuchTransition {
                activity: activity_id.clone(),
                transition: source.describe_transition(index),
            })?;
        let destination = lookup(&definition, &transition.destination, id)?;

        let entered = scope_chain(&definition, destination);
        let leaves_scope = scope_chain(&definition, source)
            .iter()
            .any(|scope| !entered.contains(scope));

        let execution = self.require_execution_mut(id)?;
        if leaves_scope && !execution.is_root() && execution.variables.is_some() {
            execution.variables = None;
            execution.is_scope = false;
        }
        execution.activity = Some(destination.id.clone());
        execution.is_active = true;
        let instance_id = execution.process_instance_id;

        self.record(
            instance_id,
            RuntimeEvent::TransitionTaken {
                execution_id: id,
                source: activity_id,
                destination: destination.id.clone(),
                transition: transition.id.clone(),
            },
        );
        self.push(Operation::Enter { execution: id });
        Ok(())
    }

    fn end(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let execution = self.require_execution(id)?.clone();
        for descendant in self.tree.descendants(id) {
            self.tree.remove(descendant);
            self.delete_jobs_of(descendant);
        }

        let Some(parent) = execution.parent else {
            self.complete_instance(execution.process_instance_id);
            return Ok(());
        };

        self.tree.remove(id);
        self.delete_jobs_of(id);
        if execution.is_concurrent {
            self.tree.touch(parent);
        }
        tracing::debug!(execution_id = %id, "Execution ended");

        if self.execution(parent).is_some() && self.tree.concurrent_children(parent).is_empty() {
            self.push(Operation::End { execution: parent });
        }
        Ok(())
    }

    // ── Built-in behaviors ──

    /// Default transition, or end when there is none.
    fn leave(&mut self, id: ExecutionId, activity: &Activity) -> Result<(), EngineError> {
        match activity.find_transition(None) {
            Some(transition) => self.push(Operation::Take {
                execution: id,
                transition,
            }),
            None => self.push(Operation::End { execution: id }),
        }
        Ok(())
    }

    fn decide(
        &mut self,
        id: ExecutionId,
        activity: &Activity,
        routes: &[DecisionRoute],
        default: Option<&str>,
    ) -> Result<(), EngineError> {
        let chosen = routes
            .iter()
            .find(|route| {
                route
                    .condition
                    .evaluate(self.variable(id, &route.condition.variable))
            })
            .map(|route| route.transition.as_str())
            .or(default)
            .ok_or_else(|| EngineError::NoApplicableTransition {
                activity: activity.id.clone(),
            })?;

        let transition =
            activity
                .transition_by_id(chosen)
                .ok_or_else(|| EngineError::NoSuchTransition {
                    activity: activity.id.clone(),
                    transition: format!("'{chosen}'"),
                })?;
        tracing::debug!(execution_id = %id, activity = %activity.id, transition = chosen, "Decision routed");
        self.push(Operation::Take {
            execution: id,
            transition,
        });
        Ok(())
    }

    async fn fork(&mut self, id: ExecutionId, activity: &Activity) -> Result<(), EngineError> {
        if activity.outgoing.is_empty() {
            self.push(Operation::End { execution: id });
            return Ok(());
        }

        let execution = self.require_execution(id)?.clone();
        let scope_id = match (execution.is_concurrent, execution.parent) {
            (true, Some(parent)) => parent,
            (true, None) => {
                return Err(EngineError::invalid_state(id, "concurrent execution without parent"))
            }
            (false, _) => id,
        };
        let scope = self.require_execution(scope_id)?.clone();

        let mut children = Vec::with_capacity(activity.outgoing.len());
        for transition in 0..activity.outgoing.len() {
            let child_id = ExecutionId(self.next_id().await?);
            let mut child = Execution::new_concurrent_child(child_id, &scope);
            child.activity = Some(activity.id.clone());
            if execution.is_concurrent && execution.variables.is_some() {
                child.variables = execution.variables.clone();
                child.is_scope = true;
            }
            self.tree.insert(child);
            self.push(Operation::Take {
                execution: child_id,
                transition,
            });
            children.push(child_id);
        }

        if execution.is_concurrent {
            self.tree.remove(id);
            self.delete_jobs_of(id);
            self.tree.touch(scope_id);
        } else {
            self.deactivate(id)?;
        }

        tracing::debug!(scope_id = %scope_id, activity = %activity.id, branches = children.len(), "Forked");
        self.record(
            scope.process_instance_id,
            RuntimeEvent::Forked {
                scope_id,
                activity: activity.id.clone(),
                children,
            },
        );
        Ok(())
    }

    fn join(&mut self, id: ExecutionId, activity: &Activity) -> Result<(), EngineError> {
        let execution = self.require_execution(id)?.clone();
        let Some(scope_id) = execution.parent.filter(|_| execution.is_concurrent) else {
            // Nothing to synchronize with.
            return self.leave(id, activity);
        };

        self.deactivate(id)?;
        // Arrivals at one join commit one after another.
        self.tree.touch(scope_id);
        let expected = activity.incoming.max(1);
        let siblings = self.tree.concurrent_children(scope_id);
        let mut arrived: Vec<ExecutionId> = siblings
            .iter()
            .copied()
            .filter(|&s| {
                s != id
                    && self
                        .execution(s)
                        .is_some_and(|e| !e.is_active && e.is_at(&activity.id))
            })
            .collect();
        arrived.insert(0, id);

        self.record(
            execution.process_instance_id,
            RuntimeEvent::JoinArrived {
                execution_id: id,
                activity: activity.id.clone(),
                arrived: arrived.len(),
                expected,
            },
        );
        if arrived.len() < expected {
            tracing::debug!(execution_id = %id, activity = %activity.id, arrived = arrived.len(), expected, "Join waiting");
            return Ok(());
        }

        arrived.truncate(expected);
        let continued_by = if siblings.len() == arrived.len() {
            for &joined in &arrived {
                self.tree.remove(joined);
                self.delete_jobs_of(joined);
            }
            let scope = self.require_execution_mut(scope_id)?;
            scope.activity = Some(activity.id.clone());
            scope.is_active = true;
            scope_id
        } else {
            for &joined in arrived.iter().skip(1) {
                self.tree.remove(joined);
                self.delete_jobs_of(joined);
            }
            self.require_execution_mut(id)?.is_active = true;
            id
        };

        self.record(
            execution.process_instance_id,
            RuntimeEvent::JoinReleased {
                activity: activity.id.clone(),
                continued_by,
            },
        );
        self.leave(continued_by, activity)
    }

    // ── Signals ──

    pub(crate) async fn signal_execution(
        &mut self,
        id: ExecutionId,
        signal: Option<&str>,
        payload: Variables,
    ) -> Result<(), EngineError> {
        let execution = self.load_execution(id).await?;
        if execution.is_active {
            return Err(EngineError::invalid_state(id, "execution is active"));
        }
        let (definition, activity_id) = self.locate(id)?;
        let activity = lookup(&definition, &activity_id, id)?;

        match &activity.behavior {
            Behavior::WaitState => {
                self.set_variables(id, payload)?;
                self.record_signal(&execution, &activity_id, signal);
                if activity.outgoing.is_empty() {
                    self.push(Operation::End { execution: id });
                    return Ok(());
                }
                let transition = activity.find_transition(signal).ok_or_else(|| {
                    EngineError::NoSuchTransition {
                        activity: activity_id.clone(),
                        transition: describe_signal(signal),
                    }
                })?;
                self.push(Operation::Take {
                    execution: id,
                    transition,
                });
                Ok(())
            }
            Behavior::Custom { name, config } => {
                let behavior = self
                    .services()
                    .behaviors
                    .get(name)
                    .ok_or_else(|| EngineError::UnknownBehavior(name.clone()))?;
                self.record_signal(&execution, &activity_id, signal);
                let mut bcx = BehaviorContext::new(self, id, activity, config);
                behavior.signal(&mut bcx, signal, payload).await.map_err(|e| {
                    EngineError::from_extension(e, |source| EngineError::Behavior {
                        activity: activity_id.clone(),
                        source,
                    })
                })
            }
            other => Err(EngineError::invalid_state(
                id,
                format!(
                    "activity '{}' ({}) does not accept signals",
                    activity_id,
                    other.tag()
                ),
            )),
        }
    }

    fn record_signal(&mut self, execution: &Execution, activity: &str, signal: Option<&str>) {
        self.record(
            execution.process_instance_id,
            RuntimeEvent::Signalled {
                execution_id: execution.id,
                activity: activity.to_string(),
                signal: signal.map(str::to_string),
            },
        );
    }

    // ── Extension helpers ──

    /// Park an execution until a signal or job resumes it.
    pub fn deactivate(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        self.require_execution_mut(id)?.is_active = false;
        Ok(())
    }

    /// Schedule a transition by name (`None` for the default transition).
    pub fn take_transition(
        &mut self,
        id: ExecutionId,
        transition: Option<&str>,
    ) -> Result<(), EngineError> {
        let (definition, activity_id) = self.locate(id)?;
        let activity = lookup(&definition, &activity_id, id)?;
        let index =
            activity
                .find_transition(transition)
                .ok_or_else(|| EngineError::NoSuchTransition {
                    activity: activity_id.clone(),
                    transition: describe_signal(transition),
                })?;
        self.push(Operation::Take {
            execution: id,
            transition: index,
        });
        Ok(())
    }

    /// Leave the current activity like an automatic one.
    pub fn leave_activity(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let (definition, activity_id) = self.locate(id)?;
        let activity = lookup(&definition, &activity_id, id)?;
        self.leave(id, activity)
    }

    pub fn end_execution(&mut self, id: ExecutionId) {
        self.push(Operation::End { execution: id });
    }

    /// Re-activate a parked execution and run its activity's behavior.
    pub fn resume_activity(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        self.require_execution_mut(id)?.is_active = true;
        self.push(Operation::ExecuteActivity { execution: id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Barrier;

    use super::*;
    use crate::engine::ProcessEngine;
    use crate::graph::ProcessGraphBuilder;
    use crate::pipeline::Command;
    use crate::store_memory::MemoryStore;

    /// Signal an execution and advance it, then hold the first attempt at
    /// the barrier so every party has read the tree before anyone commits.
    struct RendezvousSignal {
        execution_id: ExecutionId,
        barrier: Arc<Barrier>,
        waited: AtomicBool,
    }

    impl RendezvousSignal {
        fn new(execution_id: ExecutionId, barrier: &Arc<Barrier>) -> Self {
            Self {
                execution_id,
                barrier: barrier.clone(),
                waited: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Command for RendezvousSignal {
        type Output = ();

        fn name(&self) -> &'static str {
            "RendezvousSignal"
        }

        async fn execute(&self, cx: &mut CommandContext) -> Result<(), EngineError> {
            cx.signal_execution(self.execution_id, None, Variables::new())
                .await?;
            cx.drain_agenda().await?;
            if !self.waited.swap(true, Ordering::SeqCst) {
                self.barrier.wait().await;
            }
            Ok(())
        }
    }

    async fn start_parallel(
        engine: &ProcessEngine,
        key: &str,
        join: bool,
    ) -> (ExecutionId, ExecutionId, ExecutionId) {
        let mut builder = ProcessGraphBuilder::new(key)
            .node("fork", Behavior::Fork)
            .node("w1", Behavior::WaitState)
            .node("w2", Behavior::WaitState)
            .transition("fork", "w1")
            .transition("fork", "w2");
        if join {
            builder = builder
                .node("join", Behavior::Join)
                .node("done", Behavior::WaitState)
                .transition("w1", "join")
                .transition("w2", "join")
                .transition("join", "done");
        }
        engine.deploy(builder.build().unwrap()).unwrap();

        let instance = engine
            .start_process_instance(key, Variables::new())
            .await
            .unwrap();
        let executions = engine.executions_for_instance(instance).await.unwrap();
        let at = |activity: &str| {
            executions
                .iter()
                .find(|e| e.is_at(activity))
                .map(|e| e.id)
                .unwrap()
        };
        (instance, at("w1"), at("w2"))
    }

    #[tokio::test]
    async fn test_concurrent_arrivals_release_the_join() {
        let engine = ProcessEngine::builder(Arc::new(MemoryStore::new())).build();
        let (instance, w1, w2) = start_parallel(&engine, "parallel-review", true).await;

        let barrier = Arc::new(Barrier::new(2));
        let first = RendezvousSignal::new(w1, &barrier);
        let second = RendezvousSignal::new(w2, &barrier);
        let (r1, r2) = tokio::join!(engine.execute(&first), engine.execute(&second));
        r1.unwrap();
        r2.unwrap();

        let executions = engine.executions_for_instance(instance).await.unwrap();
        assert_eq!(executions.len(), 1, "join never released: {executions:?}");
        assert!(executions[0].is_root());
        assert!(executions[0].is_at("done"));

        let released = engine
            .events(instance)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e, RuntimeEvent::JoinReleased { .. }))
            .count();
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn test_concurrent_branch_ends_complete_the_instance() {
        let engine = ProcessEngine::builder(Arc::new(MemoryStore::new())).build();
        let (instance, w1, w2) = start_parallel(&engine, "parallel-ends", false).await;

        let barrier = Arc::new(Barrier::new(2));
        let first = RendezvousSignal::new(w1, &barrier);
        let second = RendezvousSignal::new(w2, &barrier);
        let (r1, r2) = tokio::join!(engine.execute(&first), engine.execute(&second));
        r1.unwrap();
        r2.unwrap();

        assert!(engine.executions_for_instance(instance).await.unwrap().is_empty());
        let events = engine.events(instance).await.unwrap();
        assert!(matches!(events.last(), Some(RuntimeEvent::InstanceCompleted { .. })));
    }
}
