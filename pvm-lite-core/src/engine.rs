//! Engine facade and shared services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::authoring::validate::{validate_graph, Severity, ValidationIssue};
use crate::authoring::yaml::parse_process_yaml;
use crate::behavior::{ActivityBehavior, BehaviorRegistry};
use crate::commands::{SignalExecution, StartProcessInstance};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::graph::ProcessGraph;
use crate::idgen::IdGenerator;
use crate::jobs::{JobExecutor, JobHandler, JobHandlerRegistry};
use crate::pipeline::{Command, CommandExecutor};
use crate::repository::{DefinitionRef, DefinitionRepository, Deployment};
use crate::store::ProcessStore;
use crate::types::*;

/// Everything a unit of work needs, shared by every command.
pub struct EngineServices {
    pub config: EngineConfig,
    pub store: Arc<dyn ProcessStore>,
    pub ids: IdGenerator,
    pub repository: DefinitionRepository,
    pub behaviors: BehaviorRegistry,
    pub job_handlers: JobHandlerRegistry,
    pub clock: Arc<dyn Clock>,
    /// Fired after commits that created due work.
    pub job_notify: Notify,
    pub shutting_down: AtomicBool,
}

// ── Builder ──

pub struct ProcessEngineBuilder {
    store: Arc<dyn ProcessStore>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    behaviors: BehaviorRegistry,
    job_handlers: JobHandlerRegistry,
}

impl ProcessEngineBuilder {
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            behaviors: BehaviorRegistry::new(),
            job_handlers: JobHandlerRegistry::with_builtins(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn behavior(
        self,
        name: impl Into<String>,
        behavior: Arc<dyn ActivityBehavior>,
    ) -> anyhow::Result<Self> {
        self.behaviors.register(name, behavior)?;
        Ok(self)
    }

    pub fn job_handler(
        self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> anyhow::Result<Self> {
        self.job_handlers.register(job_type, handler)?;
        Ok(self)
    }

    pub fn build(self) -> ProcessEngine {
        let ids = IdGenerator::new(self.store.clone(), self.config.id_block_size);
        let services = Arc::new(EngineServices {
            config: self.config,
            store: self.store,
            ids,
            repository: DefinitionRepository::new(),
            behaviors: self.behaviors,
            job_handlers: self.job_handlers,
            clock: self.clock,
            job_notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        });
        ProcessEngine {
            executor: CommandExecutor::new(services.clone()),
            services,
        }
    }
}

// ── ProcessEngine ──

/// Cheap to clone; all clones share one set of services.
#[derive(Clone)]
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    executor: CommandExecutor,
}

impl ProcessEngine {
    pub fn builder(store: Arc<dyn ProcessStore>) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub(crate) fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn behaviors(&self) -> &BehaviorRegistry {
        &self.services.behaviors
    }

    pub fn job_handlers(&self) -> &JobHandlerRegistry {
        &self.services.job_handlers
    }

    pub fn repository(&self) -> &DefinitionRepository {
        &self.services.repository
    }

    // ── Deployment ──

    /// Validate and publish `graph` as a new version.
    pub fn deploy(&self, graph: ProcessGraph) -> Result<Deployment, EngineError> {
        let warnings = self.validate(&graph)?;
        let now = self.services.clock.now();
        self.services.repository.deploy(graph, warnings, now)
    }

    /// Like `deploy`, but keeps the latest version when nothing changed.
    pub fn deploy_if_changed(&self, graph: ProcessGraph) -> Result<Deployment, EngineError> {
        let warnings = self.validate(&graph)?;
        let now = self.services.clock.now();
        self.services
            .repository
            .deploy_if_changed(graph, warnings, now)
    }

    /// Parse a YAML definition and `deploy_if_changed` it.
    pub fn deploy_yaml(&self, yaml: &str) -> Result<Deployment, EngineError> {
        let dto = parse_process_yaml(yaml)?;
        self.deploy_if_changed(dto.into_graph()?)
    }

    fn validate(&self, graph: &ProcessGraph) -> Result<Vec<ValidationIssue>, EngineError> {
        let registry = self
            .services
            .config
            .strict_behaviors
            .then_some(&self.services.behaviors);
        let (errors, warnings): (Vec<_>, Vec<_>) = validate_graph(graph, registry)
            .into_iter()
            .partition(|issue| issue.severity == Severity::Error);

        for warning in &warnings {
            tracing::warn!(definition = graph.key(), issue = %warning, "Definition validation warning");
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation {
                key: graph.key().to_string(),
                issues: errors,
            });
        }
        Ok(warnings)
    }

    // ── Commands ──

    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, EngineError> {
        self.executor.execute(command).await
    }

    pub async fn start_process_instance(
        &self,
        definition: impl Into<DefinitionRef>,
        variables: Variables,
    ) -> Result<ExecutionId, EngineError> {
        self.execute(&StartProcessInstance::new(definition).with_variables(variables))
            .await
    }

    pub async fn signal(
        &self,
        execution_id: ExecutionId,
        signal: Option<&str>,
        payload: Variables,
    ) -> Result<(), EngineError> {
        let mut command = SignalExecution::new(execution_id).with_payload(payload);
        command.signal = signal.map(str::to_string);
        self.execute(&command).await
    }

    // ── Queries ──

    pub async fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, EngineError> {
        Ok(self.services.store.load_execution(id).await?)
    }

    pub async fn executions_for_instance(
        &self,
        instance_id: ExecutionId,
    ) -> Result<Vec<Execution>, EngineError> {
        Ok(self.services.store.load_executions(instance_id).await?)
    }

    pub async fn jobs_for_instance(&self, instance_id: ExecutionId) -> Result<Vec<Job>, EngineError> {
        Ok(self.services.store.load_jobs_for_instance(instance_id).await?)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, EngineError> {
        Ok(self.services.store.load_job(id).await?)
    }

    pub async fn failed_jobs(&self) -> Result<Vec<Job>, EngineError> {
        Ok(self.services.store.find_failed_jobs().await?)
    }

    pub async fn events(&self, instance_id: ExecutionId) -> Result<Vec<RuntimeEvent>, EngineError> {
        let events = self.services.store.read_events(instance_id, 0).await?;
        Ok(events.into_iter().map(|(_, event)| event).collect())
    }

    // ── Scheduler ──

    pub fn job_executor(&self) -> JobExecutor {
        JobExecutor::new(self.clone())
    }

    /// Mark the engine as shutting down; in-flight failures log at `warn`.
    pub fn shutdown(&self) {
        if !self.services.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::info!("Process engine shutting down");
        }
        self.services.job_notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.services.shutting_down.load(Ordering::SeqCst)
    }
}
