//! Workflow engine
//!
//! Registers validated workflow definitions and drives their executions:
//! one drive loop per run, steps dispatched through the queue dispatcher,
//! completions routed back over per-execution channels.

mod driver;
mod router;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::persistence::{Store, StoreError};
use crate::registry::HandlerRegistry;
use crate::reliability::RetryPolicy;
use crate::workflow::{
    Context, Workflow, WorkflowExecution, WorkflowState,
};

use driver::Driver;
use router::{ControlMsg, DriverMsg, DriverRoutes};
pub use router::StepRouter;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-attempt budget for steps without an override.
    pub default_step_timeout: Duration,

    /// Retry budget for steps without an override.
    pub default_step_retries: u32,

    /// Backoff between step retries.
    pub step_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(300),
            default_step_retries: 0,
            step_retry: RetryPolicy::exponential(Duration::from_secs(1)),
        }
    }
}

impl EngineConfig {
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_default_step_retries(mut self, retries: u32) -> Self {
        self.default_step_retries = retries;
        self
    }

    pub fn with_step_retry(mut self, policy: RetryPolicy) -> Self {
        self.step_retry = policy;
        self
    }
}

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("workflow {0:?} is disabled")]
    WorkflowDisabled(String),

    #[error("no live execution {0}")]
    ExecutionNotFound(Uuid),
}

/// Registers workflows and runs their executions.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    routes: DriverRoutes,
    shutdown: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            registry,
            clock,
            config,
            routes: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Completion sink for step runs; the supervisor wires it into the
    /// dispatcher's router.
    pub fn step_sink(&self) -> StepRouter {
        StepRouter::new(Arc::clone(&self.routes))
    }

    /// Register a workflow definition.
    ///
    /// The builder already validated the DAG. Registration is idempotent
    /// on identical contents; changed contents replace the stored
    /// definition.
    #[instrument(skip(self, workflow), fields(workflow = %workflow.name))]
    pub async fn register(&self, workflow: Workflow) -> Result<(), EngineError> {
        if let Ok(existing) = self.store.get_workflow(&workflow.name).await {
            if existing.fingerprint() == workflow.fingerprint() {
                return Ok(());
            }
            info!(workflow = %workflow.name, "replacing workflow definition");
        }
        self.store.register_workflow(Arc::new(workflow)).await?;
        Ok(())
    }

    /// Start one execution of a registered workflow. Returns its id; the
    /// drive loop runs in the background.
    #[instrument(skip(self, context))]
    pub async fn start(&self, workflow: &str, context: Context) -> Result<Uuid, EngineError> {
        let definition = self.store.get_workflow(workflow).await?;
        if definition.state == WorkflowState::Disabled {
            return Err(EngineError::WorkflowDisabled(workflow.to_string()));
        }

        let exec = WorkflowExecution::begin(
            workflow,
            definition.roots(),
            context,
            definition.trigger,
            self.clock.now(),
        );
        let exec_id = exec.id;
        self.store.record_workflow_start(exec.clone()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(exec_id, tx);

        let driver = Driver {
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            routes: Arc::clone(&self.routes),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(driver.drive(definition, exec, rx));

        Ok(exec_id)
    }

    /// Deliver an approval for a gated step.
    pub fn approve(&self, execution: Uuid, step: &str) -> Result<(), EngineError> {
        self.send(
            execution,
            DriverMsg::Control(ControlMsg::Approve {
                step: step.to_string(),
            }),
        )
    }

    /// Pause an execution; in-flight steps continue, nothing new starts.
    pub fn pause(&self, execution: Uuid) -> Result<(), EngineError> {
        self.send(execution, DriverMsg::Control(ControlMsg::Pause))
    }

    /// Resume a paused execution, optionally merging a context overlay.
    pub fn resume(&self, execution: Uuid, overlay: Option<Context>) -> Result<(), EngineError> {
        self.send(execution, DriverMsg::Control(ControlMsg::Resume { overlay }))
    }

    /// Cancel an execution; optionally run the rollback chain.
    pub fn cancel(
        &self,
        execution: Uuid,
        rollback: bool,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.send(
            execution,
            DriverMsg::Control(ControlMsg::Cancel {
                rollback,
                reason: reason.to_string(),
            }),
        )
    }

    /// Fetch the persisted state of an execution.
    pub async fn execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        Ok(self.store.get_workflow_execution(id).await?)
    }

    /// Number of live drive loops.
    pub fn live_executions(&self) -> usize {
        self.routes.len()
    }

    /// Stop every drive loop; executions stay as persisted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn send(&self, execution: Uuid, msg: DriverMsg) -> Result<(), EngineError> {
        let tx = self
            .routes
            .get(&execution)
            .ok_or(EngineError::ExecutionNotFound(execution))?;
        tx.send(msg)
            .map_err(|_| EngineError::ExecutionNotFound(execution))
    }
}
