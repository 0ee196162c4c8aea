//! Supervisor and lifecycle
//!
//! Wires the subsystems together and starts them in dependency order:
//! store, coordinator, dispatcher, workflow engine, scheduler. Shutdown
//! runs the same order in reverse: the scheduler stops enqueuing, the
//! dispatcher drains and then cancels, and finally this node's locks are
//! released.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::cluster::{Coordinator, SingleNodeCoordinator, StoreBackedCoordinator};
use crate::config::{Config, ConfigError, PeerMode, StoreChoice};
use crate::dispatch::{Dispatcher, DispatcherConfig, JobRun, RunKind, RunOutcome, RunSink};
use crate::dlq::DeadLetterPipeline;
use crate::engine::{EngineConfig, EngineError, StepRouter, WorkflowEngine};
use crate::job::Job;
use crate::persistence::{MemoryStore, Store};
use crate::registry::HandlerRegistry;
use crate::scheduler::{Finalizer, JobScheduler, SchedulerConfig, SchedulerError};
use crate::workflow::Workflow;

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("supervisor is already running")]
    AlreadyRunning,

    #[error("supervisor is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorState {
    Idle,
    Running,
    Stopped,
}

/// Routes completions by run kind: job runs to the finalizer, step runs
/// to the workflow engine.
struct OutcomeRouter {
    jobs: Arc<Finalizer>,
    steps: Arc<StepRouter>,
}

#[async_trait]
impl RunSink for OutcomeRouter {
    async fn on_outcome(&self, run: JobRun, outcome: RunOutcome) {
        match run.kind {
            RunKind::Job => self.jobs.on_outcome(run, outcome).await,
            RunKind::Step { .. } => self.steps.on_outcome(run, outcome).await,
        }
    }
}

/// Owns every subsystem and drives the process lifecycle.
///
/// # Example
///
/// ```ignore
/// use tickwork::prelude::*;
///
/// let registry = Arc::new(HandlerRegistry::new());
/// registry.register("reports.generate", |ctx| async move { PerformOutcome::Ok });
///
/// let supervisor = Supervisor::new(Config::default(), registry);
/// supervisor.start().await?;
/// // ... register jobs, run workflows ...
/// supervisor.shutdown().await?;
/// ```
pub struct Supervisor {
    config: Config,
    node_id: String,
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    coordinator: Arc<dyn Coordinator>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<JobScheduler>,
    engine: Arc<WorkflowEngine>,
    dlq: Arc<DeadLetterPipeline>,
    finalizer: Arc<Finalizer>,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    /// Build a supervisor on the configured store and the system clock.
    pub fn new(config: Config, registry: Arc<HandlerRegistry>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn Store> = match config.store {
            StoreChoice::Memory => Arc::new(MemoryStore::with_clock(Arc::clone(&clock))),
        };
        Self::with_parts(config, store, registry, clock)
    }

    /// Build with an injected store and clock (tests, custom backends).
    pub fn with_parts(
        config: Config,
        store: Arc<dyn Store>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let node_id = format!("node-{}", Uuid::now_v7());

        let coordinator: Arc<dyn Coordinator> = match config.peer {
            PeerMode::Single => Arc::new(SingleNodeCoordinator::with_clock(Arc::clone(&clock))),
            PeerMode::Distributed => {
                Arc::new(StoreBackedCoordinator::new(Arc::clone(&store), &node_id))
            }
        };

        let dispatcher_config = DispatcherConfig {
            queues: config.queues.clone(),
            default_concurrency: 10,
            max_pending: config.max_pending,
            lock_safety_margin: config.lock_safety_margin,
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            Arc::clone(&clock),
            &node_id,
            dispatcher_config,
        ));

        let dlq = Arc::new(DeadLetterPipeline::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            Arc::clone(&clock),
            &node_id,
            config.dead_letter.clone(),
        ));

        let failures = Arc::new(DashMap::new());
        let finalizer = Arc::new(Finalizer::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Arc::clone(&dispatcher),
            Arc::clone(&dlq),
            Arc::clone(&clock),
            &node_id,
            config.failure_trip_threshold,
            Arc::clone(&failures),
        ));

        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            Arc::clone(&clock),
            EngineConfig::default(),
        ));

        dispatcher.set_sink(Arc::new(OutcomeRouter {
            jobs: Arc::clone(&finalizer),
            steps: Arc::new(engine.step_sink()),
        }));

        let scheduler_config = SchedulerConfig::default()
            .with_poll_interval(config.poll_interval)
            .with_lock_safety_margin(config.lock_safety_margin)
            .with_failure_trip_threshold(config.failure_trip_threshold);
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Arc::clone(&dispatcher),
            Arc::clone(&clock),
            &node_id,
            scheduler_config,
            failures,
        ));

        Self {
            config,
            node_id,
            store,
            registry,
            coordinator,
            dispatcher,
            scheduler,
            engine,
            dlq,
            finalizer,
            state: Mutex::new(SupervisorState::Idle),
        }
    }

    /// Validate configuration and start children in dependency order.
    ///
    /// Reboot jobs dispatch exactly once, here.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.config.validate()?;
        {
            let mut state = self.state.lock();
            if *state == SupervisorState::Running {
                return Err(SupervisorError::AlreadyRunning);
            }
            *state = SupervisorState::Running;
        }

        self.dispatcher.start();

        if self.config.enabled {
            let reboots = self.scheduler.dispatch_reboot_jobs().await?;
            if reboots > 0 {
                info!(reboots, "dispatched reboot jobs");
            }
            Arc::clone(&self.scheduler).start();
        } else {
            info!("scheduling disabled by configuration; dispatcher only");
        }

        info!(node_id = %self.node_id, "supervisor started");
        Ok(())
    }

    /// Graceful shutdown: stop enqueuing, drain workers for up to
    /// `shutdown_timeout`, cancel stragglers, release this node's locks.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        {
            let mut state = self.state.lock();
            if *state != SupervisorState::Running {
                return Err(SupervisorError::NotRunning);
            }
            *state = SupervisorState::Stopped;
        }

        self.scheduler.stop();
        self.finalizer.stop();
        self.dispatcher.shutdown(self.config.shutdown_timeout).await;
        self.engine.shutdown();

        if let Err(e) = self.coordinator.release_owned(&self.node_id).await {
            warn!("failed to release node locks: {e}");
        }

        info!(node_id = %self.node_id, "supervisor stopped");
        Ok(())
    }

    // =========================================================================
    // Facade
    // =========================================================================

    /// Register a job through the scheduler (seeds `next_run_at`).
    pub async fn register_job(&self, job: Job) -> Result<(), SupervisorError> {
        Ok(self.scheduler.register(job).await?)
    }

    /// Register a workflow definition.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<(), SupervisorError> {
        Ok(self.engine.register(workflow).await?)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterPipeline> {
        &self.dlq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::PerformOutcome;
    use crate::schedule::Schedule;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn start_validates_config() {
        let registry = Arc::new(HandlerRegistry::new());
        let supervisor = Supervisor::new(
            Config::default().with_queue("bad", 0),
            registry,
        );
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let registry = Arc::new(HandlerRegistry::new());
        let supervisor = Supervisor::new(Config::default(), registry);
        supervisor.start().await.unwrap();
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::AlreadyRunning)
        ));
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_requires_running() {
        let registry = Arc::new(HandlerRegistry::new());
        let supervisor = Supervisor::new(Config::default(), registry);
        assert!(matches!(
            supervisor.shutdown().await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn reboot_jobs_run_once_at_start() {
        let registry = Arc::new(HandlerRegistry::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_body = Arc::clone(&runs);
        registry.register("warmup", move |_| {
            let runs = Arc::clone(&runs_body);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                PerformOutcome::Ok
            }
        });

        let supervisor = Supervisor::new(Config::default(), registry);
        supervisor
            .register_job(
                Job::builder("cache_warmup", "warmup")
                    .schedule(Schedule::Reboot)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        supervisor.start().await.unwrap();
        // The reboot job executes shortly after start.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        supervisor.shutdown().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_config_skips_scheduler() {
        let registry = Arc::new(HandlerRegistry::new());
        let supervisor = Supervisor::new(Config::default().disabled(), registry);
        supervisor
            .register_job(
                Job::builder("never", "missing")
                    .schedule(Schedule::Reboot)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        supervisor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Nothing dispatched: no executions recorded.
        let execs = self::list_executions(&supervisor, "never").await;
        assert!(execs.is_empty());
        supervisor.shutdown().await.unwrap();
    }

    async fn list_executions(
        supervisor: &Supervisor,
        job: &str,
    ) -> Vec<crate::job::Execution> {
        supervisor
            .store()
            .list_executions(job, crate::persistence::Pagination::default())
            .await
            .unwrap()
    }
}
