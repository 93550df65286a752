use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::{ActivityDecl, Behavior, DecisionRoute, ProcessGraph, ProcessGraphBuilder};

// ── Helper defaults for serde ──

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !v
}

fn is_true(v: &bool) -> bool {
    *v
}

// ── Top-level DTO ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDto {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Defaults to the first activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,
    pub activities: Vec<ActivityDto>,
    #[serde(default)]
    pub transitions: Vec<TransitionDto>,
}

// ── Activity ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityDto {
    pub id: String,
    #[serde(flatten)]
    pub behavior: BehaviorDto,
    /// Enclosing scope activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub scope: bool,
    #[serde(default, rename = "async", skip_serializing_if = "is_false")]
    pub asynchronous: bool,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub exclusive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BehaviorDto {
    Automatic,
    WaitState,
    Decision {
        #[serde(default)]
        routes: Vec<DecisionRoute>,
        #[serde(default)]
        default: Option<String>,
    },
    Fork,
    Join,
    Timer {
        duration_ms: u64,
    },
    Custom {
        name: String,
        #[serde(default)]
        config: String,
    },
}

impl From<BehaviorDto> for Behavior {
    fn from(dto: BehaviorDto) -> Self {
        match dto {
            BehaviorDto::Automatic => Behavior::Automatic,
            BehaviorDto::WaitState => Behavior::WaitState,
            BehaviorDto::Decision { routes, default } => Behavior::Decision { routes, default },
            BehaviorDto::Fork => Behavior::Fork,
            BehaviorDto::Join => Behavior::Join,
            BehaviorDto::Timer { duration_ms } => Behavior::Timer { duration_ms },
            BehaviorDto::Custom { name, config } => Behavior::Custom { name, config },
        }
    }
}

// ── Transition ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDto {
    pub from: String,
    pub to: String,
    /// Name used by decisions and signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ProcessDto {
    /// Drive the graph builder. Structural errors surface as `GraphError`;
    /// semantic checks happen at deployment.
    pub fn into_graph(self) -> Result<ProcessGraph, GraphError> {
        let mut builder = ProcessGraphBuilder::new(self.key);
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(initial) = self.initial {
            builder = builder.initial(initial);
        }

        for activity in self.activities {
            let mut decl = ActivityDecl::new(activity.id, activity.behavior.into())
                .exclusive(activity.exclusive);
            if activity.scope {
                decl = decl.scope();
            }
            if let Some(scope) = activity.within {
                decl = decl.within(scope);
            }
            if activity.asynchronous {
                decl = decl.asynchronous();
            }
            builder = builder.activity(decl);
        }

        for t in self.transitions {
            builder = match t.id {
                Some(id) => builder.named_transition(id, t.from, t.to),
                None => builder.transition(t.from, t.to),
            };
        }

        builder.build()
    }
}
