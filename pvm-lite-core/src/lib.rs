//! pvm-lite: a process virtual machine.
//!
//! An immutable [`ProcessGraph`] of activities and transitions is deployed as
//! a versioned definition; instances advance through a tree of execution
//! cursors, driven by an explicit agenda inside transactional commands, and
//! resume later on signal or through the job scheduler.

pub mod agenda;
pub mod authoring;
pub mod behavior;
pub mod commands;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod idgen;
pub mod jobs;
pub mod pipeline;
pub mod repository;
mod runtime;
pub mod store;
pub mod store_memory;
pub mod tree;
pub mod types;

pub use behavior::{ActivityBehavior, BehaviorContext, BehaviorRegistry};
pub use commands::*;
pub use config::{EngineConfig, JobExecutorConfig};
pub use context::CommandContext;
pub use engine::{EngineServices, ProcessEngine, ProcessEngineBuilder};
pub use error::{EngineError, GraphError, StoreError};
pub use events::RuntimeEvent;
pub use graph::{
    Activity, ActivityDecl, Behavior, Condition, ConditionOp, DecisionRoute, ProcessGraph,
    ProcessGraphBuilder, Transition,
};
pub use jobs::{JobExecutor, JobHandler, JobHandlerRegistry};
pub use pipeline::Command;
pub use repository::{DefinitionId, DefinitionRef, Deployment, ProcessDefinition};
pub use store::{ChangeSet, ProcessStore};
pub use store_memory::MemoryStore;
pub use types::*;
