//! Immutable process graph: activities, transitions, scopes.
//!
//! Built once through [`ProcessGraphBuilder`], then shared read-only (behind
//! `Arc`) by every execution tree running it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::GraphError;
use crate::types::{ActivityId, Value};

// ─── Conditions ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
}

/// `variable <op> value`. A missing variable compares as `Null`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub op: ConditionOp,
    pub value: Value,
}

impl Condition {
    pub fn new(variable: impl Into<String>, op: ConditionOp, value: impl Into<Value>) -> Self {
        Self {
            variable: variable.into(),
            op,
            value: value.into(),
        }
    }

    pub fn evaluate(&self, actual: Option<&Value>) -> bool {
        let actual = actual.unwrap_or(&Value::Null);
        match self.op {
            ConditionOp::Eq => actual == &self.value,
            ConditionOp::Neq => actual != &self.value,
            ConditionOp::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            ConditionOp::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
        }
    }
}

/// Ordering is only defined between values of the same kind.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::I64(x), Value::I64(y)) => Some(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// One routing rule of a decision: take `transition` when `condition` holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRoute {
    pub transition: String,
    pub condition: Condition,
}

// ─── Behavior ─────────────────────────────────────────────────

/// Behavior bound to an activity. A closed set; `Custom` names an
/// implementation registered in the `BehaviorRegistry`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behavior {
    Automatic,
    WaitState,
    Decision {
        routes: Vec<DecisionRoute>,
        default: Option<String>,
    },
    Fork,
    Join,
    /// Intermediate timer: waits `duration_ms`, then takes its first transition.
    Timer {
        duration_ms: u64,
    },
    Custom {
        name: String,
        #[serde(default)]
        config: String,
    },
}

impl Behavior {
    pub fn tag(&self) -> &'static str {
        match self {
            Behavior::Automatic => "automatic",
            Behavior::WaitState => "wait-state",
            Behavior::Decision { .. } => "decision",
            Behavior::Fork => "fork",
            Behavior::Join => "join",
            Behavior::Timer { .. } => "timer",
            Behavior::Custom { .. } => "custom",
        }
    }

    /// Behaviors that never suspend the execution on their own.
    pub fn is_pass_through(&self) -> bool {
        matches!(
            self,
            Behavior::Automatic | Behavior::Decision { .. } | Behavior::Fork | Behavior::Join
        )
    }
}

// ─── Activity / Transition ────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Used for decision routing and signal names.
    pub id: Option<String>,
    pub source: ActivityId,
    pub destination: ActivityId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    /// Ordered; lookups are first-match.
    pub outgoing: Vec<Transition>,
    /// Number of incoming transitions (join fan-in).
    pub incoming: usize,
    /// Enclosing scope activity, `None` for the process level.
    pub scope: Option<ActivityId>,
    pub behavior: Behavior,
    /// Entering this activity creates a local variable frame.
    pub is_scope: bool,
    /// Entering this activity defers execution to an async-continuation job.
    pub asynchronous: bool,
    /// Jobs created for this activity run serialized per process instance.
    pub exclusive: bool,
}

impl Activity {
    /// Resolve a transition by optional name.
    ///
    /// `Some(name)` → first transition with that id. `None` → first untitled
    /// transition, else the first transition at all.
    pub fn find_transition(&self, name: Option<&str>) -> Option<usize> {
        match name {
            Some(name) => self.transition_by_id(name),
            None => self
                .outgoing
                .iter()
                .position(|t| t.id.is_none())
                .or(if self.outgoing.is_empty() { None } else { Some(0) }),
        }
    }

    pub fn transition_by_id(&self, id: &str) -> Option<usize> {
        self.outgoing
            .iter()
            .position(|t| t.id.as_deref() == Some(id))
    }

    pub fn describe_transition(&self, index: usize) -> String {
        match self.outgoing.get(index) {
            Some(Transition { id: Some(id), .. }) => format!("'{id}'"),
            Some(t) => format!("→{}", t.destination),
            None => format!("#{index}"),
        }
    }
}

// ─── ProcessGraph ─────────────────────────────────────────────

/// The immutable, unversioned graph. Versioning happens at deployment.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessGraph {
    key: String,
    name: Option<String>,
    initial: ActivityId,
    activities: Vec<Activity>,
    #[serde(skip)]
    index: HashMap<ActivityId, usize>,
}

impl ProcessGraph {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn initial(&self) -> &Activity {
        // Checked at build time.
        &self.activities[self.index[&self.initial]]
    }

    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.index.get(id).map(|&i| &self.activities[i])
    }

    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }
}

// ─── Builder ──────────────────────────────────────────────────

/// Declaration of one activity for the builder.
#[derive(Clone, Debug)]
pub struct ActivityDecl {
    id: ActivityId,
    behavior: Behavior,
    scope: Option<ActivityId>,
    is_scope: bool,
    asynchronous: bool,
    exclusive: bool,
}

impl ActivityDecl {
    pub fn new(id: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            id: id.into(),
            behavior,
            scope: None,
            is_scope: false,
            asynchronous: false,
            exclusive: true,
        }
    }

    /// Mark as scope-introducing (owns a local variable frame).
    pub fn scope(mut self) -> Self {
        self.is_scope = true;
        self
    }

    /// Place inside the scope activity `scope`.
    pub fn within(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

#[derive(Debug)]
pub struct ProcessGraphBuilder {
    key: String,
    name: Option<String>,
    initial: Option<ActivityId>,
    activities: Vec<ActivityDecl>,
    transitions: Vec<Transition>,
}

impl ProcessGraphBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            initial: None,
            activities: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Defaults to the first declared activity.
    pub fn initial(mut self, activity: impl Into<String>) -> Self {
        self.initial = Some(activity.into());
        self
    }

    pub fn activity(mut self, decl: ActivityDecl) -> Self {
        self.activities.push(decl);
        self
    }

    /// Shorthand for an activity with default flags.
    pub fn node(self, id: impl Into<String>, behavior: Behavior) -> Self {
        self.activity(ActivityDecl::new(id, behavior))
    }

    /// Untitled transition. Targets may be declared later.
    pub fn transition(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.push_transition(None, from.into(), to.into())
    }

    pub fn named_transition(
        self,
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.push_transition(Some(id.into()), from.into(), to.into())
    }

    fn push_transition(mut self, id: Option<String>, source: String, destination: String) -> Self {
        self.transitions.push(Transition {
            id,
            source,
            destination,
        });
        self
    }

    /// Resolve every forward reference and freeze the graph.
    pub fn build(self) -> Result<ProcessGraph, GraphError> {
        if self.activities.is_empty() {
            return Err(GraphError::Empty { key: self.key });
        }

        let mut index = HashMap::new();
        for (i, decl) in self.activities.iter().enumerate() {
            if index.insert(decl.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateActivity(decl.id.clone()));
            }
        }

        let initial = match self.initial {
            Some(id) if index.contains_key(&id) => id,
            Some(id) => return Err(GraphError::UnknownInitial(id)),
            None => self.activities[0].id.clone(),
        };

        for decl in &self.activities {
            if let Some(scope) = &decl.scope {
                let valid = index
                    .get(scope)
                    .is_some_and(|&i| self.activities[i].is_scope && scope != &decl.id);
                if !valid {
                    return Err(GraphError::InvalidScope {
                        activity: decl.id.clone(),
                        scope: scope.clone(),
                    });
                }
            }
        }

        let mut activities: Vec<Activity> = self
            .activities
            .into_iter()
            .map(|decl| Activity {
                id: decl.id,
                outgoing: Vec::new(),
                incoming: 0,
                scope: decl.scope,
                behavior: decl.behavior,
                is_scope: decl.is_scope,
                asynchronous: decl.asynchronous,
                exclusive: decl.exclusive,
            })
            .collect();

        for transition in self.transitions {
            let (Some(&src), Some(&dst)) = (
                index.get(&transition.source),
                index.get(&transition.destination),
            ) else {
                let missing = if index.contains_key(&transition.source) {
                    transition.destination.clone()
                } else {
                    transition.source.clone()
                };
                return Err(GraphError::UnknownActivity {
                    source_id: transition.source,
                    destination: transition.destination,
                    missing,
                });
            };
            activities[dst].incoming += 1;
            activities[src].outgoing.push(transition);
        }

        Ok(ProcessGraph {
            key: self.key,
            name: self.name,
            initial,
            activities,
            index,
        })
    }
}
