//! End-to-end process scenarios against the in-memory store.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use pvm_lite_core::{
    ActivityBehavior, ActivityDecl, Behavior, BehaviorContext, Condition, ConditionOp,
    DecisionRoute, DefinitionId, DeleteProcessInstance, EngineConfig, EngineError, Execution,
    ExecutionId, ManualClock, MemoryStore, ProcessEngine, ProcessGraph, ProcessGraphBuilder,
    RuntimeEvent, SetVariables, Value, Variables,
};

fn engine() -> (ProcessEngine, Arc<MemoryStore>) {
    engine_with(EngineConfig::default())
}

fn engine_with(config: EngineConfig) -> (ProcessEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = ProcessEngine::builder(store.clone())
        .config(config)
        .clock(Arc::new(ManualClock::new(1_000)))
        .build();
    (engine, store)
}

fn vars(pairs: &[(&str, Value)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// `(activity, is_active)` of every execution of an instance, sorted.
async fn positions(engine: &ProcessEngine, instance: ExecutionId) -> Vec<(String, bool)> {
    let mut out: Vec<(String, bool)> = engine
        .executions_for_instance(instance)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.activity.unwrap_or_default(), e.is_active))
        .collect();
    out.sort();
    out
}

async fn execution_at(engine: &ProcessEngine, instance: ExecutionId, activity: &str) -> Execution {
    engine
        .executions_for_instance(instance)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.is_at(activity))
        .unwrap_or_else(|| panic!("no execution at '{activity}'"))
}

fn fork_join_graph() -> ProcessGraph {
    ProcessGraphBuilder::new("fork-join")
        .node("a", Behavior::Automatic)
        .node("b", Behavior::Fork)
        .node("c", Behavior::Automatic)
        .node("d", Behavior::Automatic)
        .node("e", Behavior::Join)
        .node("f", Behavior::WaitState)
        .transition("a", "b")
        .transition("b", "c")
        .transition("b", "d")
        .transition("c", "e")
        .transition("d", "e")
        .transition("e", "f")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_fork_join_reaches_wait_state_and_completes_on_signal() {
    let (engine, _) = engine();
    engine.deploy(fork_join_graph()).unwrap();

    let instance = engine
        .start_process_instance("fork-join", Variables::new())
        .await
        .unwrap();

    // Concurrent children are gone; the root alone waits at f.
    assert_eq!(positions(&engine, instance).await, vec![("f".to_string(), false)]);
    let root = engine.execution(instance).await.unwrap().unwrap();
    assert!(root.is_root());
    assert!(!root.is_concurrent);

    engine.signal(instance, None, Variables::new()).await.unwrap();
    assert!(engine.executions_for_instance(instance).await.unwrap().is_empty());

    let events = engine.events(instance).await.unwrap();
    assert!(matches!(events.first(), Some(RuntimeEvent::InstanceStarted { .. })));
    assert!(matches!(events.last(), Some(RuntimeEvent::InstanceCompleted { .. })));
    let released = events
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::JoinReleased { continued_by, .. } if *continued_by == instance))
        .count();
    assert_eq!(released, 1);
}

#[tokio::test]
async fn test_join_waits_for_every_branch_in_any_order() {
    let (engine, _) = engine();
    let graph = ProcessGraphBuilder::new("approvals")
        .node("start", Behavior::Fork)
        .node("legal", Behavior::WaitState)
        .node("finance", Behavior::WaitState)
        .node("sync", Behavior::Join)
        .node("done", Behavior::WaitState)
        .transition("start", "legal")
        .transition("start", "finance")
        .transition("legal", "sync")
        .transition("finance", "sync")
        .transition("sync", "done")
        .build()
        .unwrap();
    engine.deploy(graph).unwrap();

    let instance = engine
        .start_process_instance("approvals", Variables::new())
        .await
        .unwrap();
    assert_eq!(
        positions(&engine, instance).await,
        vec![
            ("finance".to_string(), false),
            ("legal".to_string(), false),
            ("start".to_string(), false),
        ]
    );

    // Second branch first.
    let finance = execution_at(&engine, instance, "finance").await;
    engine.signal(finance.id, None, Variables::new()).await.unwrap();
    assert_eq!(
        positions(&engine, instance).await,
        vec![
            ("legal".to_string(), false),
            ("start".to_string(), false),
            ("sync".to_string(), false),
        ]
    );

    let legal = execution_at(&engine, instance, "legal").await;
    engine.signal(legal.id, None, Variables::new()).await.unwrap();
    assert_eq!(positions(&engine, instance).await, vec![("done".to_string(), false)]);
}

#[tokio::test]
async fn test_join_waits_for_every_incoming_edge() {
    let (engine, _) = engine();
    let graph = ProcessGraphBuilder::new("staggered")
        .node("split", Behavior::Fork)
        .node("a", Behavior::WaitState)
        .node("b", Behavior::WaitState)
        .node("c", Behavior::WaitState)
        .node("c-review", Behavior::WaitState)
        .node("sync", Behavior::Join)
        .node("done", Behavior::WaitState)
        .transition("split", "a")
        .transition("split", "b")
        .transition("split", "c")
        .transition("a", "sync")
        .transition("b", "sync")
        .transition("c", "c-review")
        .transition("c-review", "sync")
        .transition("sync", "done")
        .build()
        .unwrap();
    engine.deploy(graph).unwrap();
    let instance = engine
        .start_process_instance("staggered", Variables::new())
        .await
        .unwrap();

    for activity in ["a", "b", "c"] {
        let branch = execution_at(&engine, instance, activity).await;
        engine.signal(branch.id, None, Variables::new()).await.unwrap();
    }
    // Two of three edges arrived; the third branch is still on its way.
    assert_eq!(
        positions(&engine, instance).await,
        vec![
            ("c-review".to_string(), false),
            ("split".to_string(), false),
            ("sync".to_string(), false),
            ("sync".to_string(), false),
        ]
    );

    let review = execution_at(&engine, instance, "c-review").await;
    engine.signal(review.id, None, Variables::new()).await.unwrap();
    assert_eq!(positions(&engine, instance).await, vec![("done".to_string(), false)]);
}

#[tokio::test]
async fn test_decision_routes_on_variable() {
    let (engine, _) = engine();
    let graph = ProcessGraphBuilder::new("rating")
        .node(
            "route",
            Behavior::Decision {
                routes: vec![DecisionRoute {
                    transition: "premium".into(),
                    condition: Condition::new("rating", ConditionOp::Eq, "AAA+"),
                }],
                default: Some("standard".into()),
            },
        )
        .node("fast-track", Behavior::WaitState)
        .node("manual-review", Behavior::WaitState)
        .named_transition("premium", "route", "fast-track")
        .named_transition("standard", "route", "manual-review")
        .build()
        .unwrap();
    engine.deploy(graph).unwrap();

    let premium = engine
        .start_process_instance("rating", vars(&[("rating", Value::from("AAA+"))]))
        .await
        .unwrap();
    assert_eq!(
        positions(&engine, premium).await,
        vec![("fast-track".to_string(), false)]
    );

    let standard = engine
        .start_process_instance("rating", vars(&[("rating", Value::from("BB"))]))
        .await
        .unwrap();
    assert_eq!(
        positions(&engine, standard).await,
        vec![("manual-review".to_string(), false)]
    );
}

#[tokio::test]
async fn test_decision_without_match_or_default_rolls_back() {
    let (engine, store) = engine();
    let graph = ProcessGraphBuilder::new("strict")
        .node(
            "route",
            Behavior::Decision {
                routes: vec![DecisionRoute {
                    transition: "big".into(),
                    condition: Condition::new("amount", ConditionOp::Gt, 1_000i64),
                }],
                default: None,
            },
        )
        .node("review", Behavior::WaitState)
        .named_transition("big", "route", "review")
        .build()
        .unwrap();
    engine.deploy(graph).unwrap();

    let err = engine
        .start_process_instance("strict", vars(&[("amount", Value::I64(5))]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoApplicableTransition { .. }));
    assert_eq!(store.execution_count(), 0);
}

#[tokio::test]
async fn test_automatic_cycle_hits_agenda_limit() {
    let config = EngineConfig {
        agenda_limit: 50,
        ..EngineConfig::default()
    };
    let (engine, store) = engine_with(config);
    let graph = ProcessGraphBuilder::new("spin")
        .node("a", Behavior::Automatic)
        .node("b", Behavior::Automatic)
        .transition("a", "b")
        .transition("b", "a")
        .build()
        .unwrap();
    let deployment = engine.deploy(graph).unwrap();
    assert!(deployment.warnings.iter().any(|w| w.rule == "V7"));

    let err = engine
        .start_process_instance("spin", Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AgendaLimitExceeded { limit: 50 }));
    assert_eq!(store.execution_count(), 0);
}

#[tokio::test]
async fn test_signal_errors() {
    let (engine, _) = engine();
    let graph = ProcessGraphBuilder::new("named")
        .node("wait", Behavior::WaitState)
        .node("yes", Behavior::WaitState)
        .named_transition("approve", "wait", "yes")
        .build()
        .unwrap();
    engine.deploy(graph).unwrap();
    let instance = engine
        .start_process_instance("named", Variables::new())
        .await
        .unwrap();

    let err = engine
        .signal(instance, Some("reject"), Variables::new())
        .await
        .unwrap_err();
    match err {
        EngineError::NoSuchTransition { activity, transition } => {
            assert_eq!(activity, "wait");
            assert_eq!(transition, "'reject'");
        }
        other => panic!("Expected NoSuchTransition, got {other:?}"),
    }

    let err = engine
        .signal(ExecutionId(999_999), None, Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExecutionNotFound(_)));

    engine
        .signal(instance, Some("approve"), Variables::new())
        .await
        .unwrap();
    assert_eq!(positions(&engine, instance).await, vec![("yes".to_string(), false)]);
}

#[tokio::test]
async fn test_signal_payload_lands_in_instance_frame() {
    let (engine, _) = engine();
    let graph = ProcessGraphBuilder::new("payload")
        .node("wait", Behavior::WaitState)
        .node("next", Behavior::WaitState)
        .transition("wait", "next")
        .build()
        .unwrap();
    engine.deploy(graph).unwrap();
    let instance = engine
        .start_process_instance("payload", vars(&[("order", Value::I64(7))]))
        .await
        .unwrap();

    engine
        .signal(
            instance,
            None,
            vars(&[("approved", Value::Bool(true))]),
        )
        .await
        .unwrap();

    let root = engine.execution(instance).await.unwrap().unwrap();
    let frame = root.variables.unwrap();
    assert_eq!(frame.get("order"), Some(&Value::I64(7)));
    assert_eq!(frame.get("approved"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_scope_activity_owns_local_frame() {
    let (engine, _) = engine();
    let graph = ProcessGraphBuilder::new("scoped")
        .node("split", Behavior::Fork)
        .activity(ActivityDecl::new("review", Behavior::WaitState).scope())
        .node("audit", Behavior::WaitState)
        .node("sync", Behavior::Join)
        .node("done", Behavior::WaitState)
        .transition("split", "review")
        .transition("split", "audit")
        .transition("review", "sync")
        .transition("audit", "sync")
        .transition("sync", "done")
        .build()
        .unwrap();
    engine.deploy(graph).unwrap();
    let instance = engine
        .start_process_instance("scoped", vars(&[("customer", Value::from("acme"))]))
        .await
        .unwrap();

    let review = execution_at(&engine, instance, "review").await;
    assert!(review.is_scope);
    assert_eq!(review.variables, Some(Variables::new()));
    let audit = execution_at(&engine, instance, "audit").await;
    assert!(audit.variables.is_none());

    engine
        .execute(&SetVariables {
            execution_id: review.id,
            variables: vars(&[("verdict", Value::from("ok"))]),
        })
        .await
        .unwrap();
    // Written into the branch frame, not the instance frame.
    let review = engine.execution(review.id).await.unwrap().unwrap();
    assert_eq!(
        review.variables.as_ref().and_then(|v| v.get("verdict")),
        Some(&Value::from("ok"))
    );
    let root = engine.execution(instance).await.unwrap().unwrap();
    assert!(root.variables.as_ref().unwrap().get("verdict").is_none());

    // Audit has no frame of its own and writes through to the instance.
    engine
        .execute(&SetVariables {
            execution_id: audit.id,
            variables: vars(&[("audited", Value::Bool(true))]),
        })
        .await
        .unwrap();
    let root = engine.execution(instance).await.unwrap().unwrap();
    assert_eq!(
        root.variables.as_ref().and_then(|v| v.get("audited")),
        Some(&Value::Bool(true))
    );

    // Leaving the scope drops the branch frame.
    engine.signal(review.id, None, Variables::new()).await.unwrap();
    let review = engine.execution(review.id).await.unwrap().unwrap();
    assert!(review.is_at("sync"));
    assert!(review.variables.is_none());
    assert!(!review.is_scope);
}

// ── Custom behavior ──

struct Approval;

#[async_trait]
impl ActivityBehavior for Approval {
    async fn execute(&self, cx: &mut BehaviorContext<'_>) -> Result<()> {
        let reviewer = cx.config().to_string();
        cx.set_variable("reviewer", reviewer)?;
        cx.wait()
    }

    async fn signal(
        &self,
        cx: &mut BehaviorContext<'_>,
        signal: Option<&str>,
        _payload: Variables,
    ) -> Result<()> {
        match signal {
            Some("reject") => cx.take(Some("rejected")),
            _ => cx.take(Some("approved")),
        }
    }
}

fn approval_graph() -> ProcessGraph {
    ProcessGraphBuilder::new("custom")
        .node(
            "approval",
            Behavior::Custom {
                name: "approval".into(),
                config: "alice".into(),
            },
        )
        .node("accepted", Behavior::WaitState)
        .node("declined", Behavior::WaitState)
        .named_transition("approved", "approval", "accepted")
        .named_transition("rejected", "approval", "declined")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_custom_behavior_waits_and_routes_on_signal() {
    let store = Arc::new(MemoryStore::new());
    let engine = ProcessEngine::builder(store)
        .behavior("approval", Arc::new(Approval))
        .unwrap()
        .build();
    engine.deploy(approval_graph()).unwrap();

    let instance = engine
        .start_process_instance("custom", Variables::new())
        .await
        .unwrap();
    let root = engine.execution(instance).await.unwrap().unwrap();
    assert!(root.is_at("approval"));
    assert!(!root.is_active);
    assert_eq!(
        root.variables.as_ref().and_then(|v| v.get("reviewer")),
        Some(&Value::from("alice"))
    );

    engine
        .signal(instance, Some("reject"), Variables::new())
        .await
        .unwrap();
    assert_eq!(
        positions(&engine, instance).await,
        vec![("declined".to_string(), false)]
    );
}

#[tokio::test]
async fn test_unregistered_custom_behavior_rejected_at_deploy() {
    let (engine, _) = engine();
    let err = engine.deploy(approval_graph()).unwrap_err();
    match err {
        EngineError::Validation { key, issues } => {
            assert_eq!(key, "custom");
            assert!(issues.iter().any(|i| i.rule == "V5"));
        }
        other => panic!("Expected Validation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_lenient_deploy_fails_at_runtime() {
    let config = EngineConfig {
        strict_behaviors: false,
        ..EngineConfig::default()
    };
    let (engine, store) = engine_with(config);
    engine.deploy(approval_graph()).unwrap();

    let err = engine
        .start_process_instance("custom", Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownBehavior(name) if name == "approval"));
    assert_eq!(store.execution_count(), 0);
}

// ── Lifecycle ──

#[tokio::test]
async fn test_delete_instance_removes_executions_and_jobs() {
    let (engine, store) = engine();
    let graph = ProcessGraphBuilder::new("timed")
        .node("split", Behavior::Fork)
        .node("wait", Behavior::Timer { duration_ms: 60_000 })
        .node("manual", Behavior::WaitState)
        .node("sync", Behavior::Join)
        .transition("split", "wait")
        .transition("split", "manual")
        .transition("wait", "sync")
        .transition("manual", "sync")
        .build()
        .unwrap();
    engine.deploy(graph).unwrap();
    let instance = engine
        .start_process_instance("timed", Variables::new())
        .await
        .unwrap();
    assert_eq!(engine.jobs_for_instance(instance).await.unwrap().len(), 1);

    let branch = execution_at(&engine, instance, "manual").await;
    let err = engine
        .execute(&DeleteProcessInstance {
            instance_id: branch.id,
            reason: "wrong id".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    engine
        .execute(&DeleteProcessInstance {
            instance_id: instance,
            reason: "cancelled by operator".into(),
        })
        .await
        .unwrap();
    assert_eq!(store.execution_count(), 0);
    assert_eq!(store.job_count(), 0);
    match engine.events(instance).await.unwrap().last() {
        Some(RuntimeEvent::InstanceDeleted { reason, .. }) => {
            assert_eq!(reason, "cancelled by operator")
        }
        other => panic!("Expected InstanceDeleted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_running_instance_keeps_its_definition_version() {
    let (engine, _) = engine();
    let v1 = ProcessGraphBuilder::new("versioned")
        .node("wait", Behavior::WaitState)
        .node("old-end", Behavior::WaitState)
        .transition("wait", "old-end")
        .build()
        .unwrap();
    let v2 = ProcessGraphBuilder::new("versioned")
        .node("wait", Behavior::WaitState)
        .node("new-end", Behavior::WaitState)
        .transition("wait", "new-end")
        .build()
        .unwrap();

    engine.deploy(v1).unwrap();
    let old = engine
        .start_process_instance("versioned", Variables::new())
        .await
        .unwrap();
    let deployment = engine.deploy(v2).unwrap();
    assert_eq!(deployment.definition.id, DefinitionId::new("versioned", 2));
    let new = engine
        .start_process_instance("versioned", Variables::new())
        .await
        .unwrap();

    engine.signal(old, None, Variables::new()).await.unwrap();
    engine.signal(new, None, Variables::new()).await.unwrap();
    assert_eq!(positions(&engine, old).await, vec![("old-end".to_string(), false)]);
    assert_eq!(positions(&engine, new).await, vec![("new-end".to_string(), false)]);

    // Exact references still resolve the old version.
    let pinned = engine
        .start_process_instance(DefinitionId::new("versioned", 1), Variables::new())
        .await
        .unwrap();
    let root = engine.execution(pinned).await.unwrap().unwrap();
    assert_eq!(root.definition_id, DefinitionId::new("versioned", 1));
}

#[tokio::test]
async fn test_write_conflicts_are_retried() {
    let (engine, store) = engine();
    engine.deploy(fork_join_graph()).unwrap();

    store.inject_conflicts(2);
    let instance = engine
        .start_process_instance("fork-join", Variables::new())
        .await
        .unwrap();
    assert_eq!(positions(&engine, instance).await, vec![("f".to_string(), false)]);
}

#[tokio::test]
async fn test_write_conflict_surfaces_after_retries() {
    let (engine, store) = engine();
    engine.deploy(fork_join_graph()).unwrap();

    // One initial attempt plus three retries.
    store.inject_conflicts(4);
    let err = engine
        .start_process_instance("fork-join", Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WriteConflict { attempts: 4, .. }));
    assert_eq!(store.execution_count(), 0);
}

#[tokio::test]
async fn test_deploy_yaml_unchanged_keeps_version() {
    let (engine, _) = engine();
    let yaml = r#"
key: order
activities:
  - id: start
    kind: Automatic
  - id: approve
    kind: WaitState
transitions:
  - from: start
    to: approve
"#;
    let first = engine.deploy_yaml(yaml).unwrap();
    let second = engine.deploy_yaml(yaml).unwrap();
    assert!(!first.unchanged);
    assert!(second.unchanged);
    assert_eq!(second.definition.id.version, 1);
    assert_eq!(engine.repository().versions("order").len(), 1);
}
