//! # Tickwork
//!
//! A distributed job scheduler and workflow orchestration engine.
//!
//! ## Features
//!
//! - **Schedules**: 5-field cron (with time zones and macros), fixed
//!   intervals, one-shots, and run-at-boot jobs
//! - **Bounded worker pools**: one per named queue, with priority
//!   ordering, pause/resume, and live rescaling
//! - **Retries and dead-lettering**: configurable backoff with jitter,
//!   error classification, and a replayable archive of exhausted work
//! - **Workflows**: DAG-shaped multi-step runs with fan-out/fan-in,
//!   conditional edges, rollback chains, and human-approval gates
//! - **Clustering**: leader election and TTL unique locks so many nodes
//!   can share one store without double-dispatching
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Supervisor                            │
//! │     (lifecycle: start order, graceful drain, config)        │
//! └─────────────────────────────────────────────────────────────┘
//!        │                   │                       │
//!        ▼                   ▼                       ▼
//! ┌─────────────┐    ┌───────────────┐    ┌─────────────────────┐
//! │ JobScheduler │──▶│  Dispatcher   │◀──│   WorkflowEngine     │
//! │ (leader poll)│    │ (queue pools) │    │ (drive loop per run) │
//! └─────────────┘    └───────────────┘    └─────────────────────┘
//!        │                   │                       │
//!        └───────────────────┼───────────────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Store (+ Coordinator)                   │
//! │   jobs, executions, workflows, unique locks, dead letters   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tickwork::prelude::*;
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register("reports.generate", |ctx| async move {
//!     // ... do the work ...
//!     PerformOutcome::Ok
//! });
//!
//! let supervisor = Supervisor::new(Config::default(), registry);
//! supervisor.start().await?;
//!
//! supervisor
//!     .register_job(
//!         Job::builder("daily_report", "reports.generate")
//!             .schedule(Schedule::cron("0 6 * * *", "UTC")?)
//!             .queue("reports")
//!             .build()?,
//!     )
//!     .await?;
//! ```

pub mod clock;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod engine;
pub mod job;
pub mod persistence;
pub mod registry;
pub mod reliability;
pub mod schedule;
pub mod scheduler;
pub mod supervisor;
pub mod workflow;

pub(crate) mod util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::cluster::{Coordinator, LockAcquire, SingleNodeCoordinator};
    pub use crate::config::{Config, PeerMode};
    pub use crate::dispatch::{Dispatcher, DispatcherConfig, QueueStats};
    pub use crate::dlq::{DeadLetterConfig, DeadLetterPipeline};
    pub use crate::engine::{EngineConfig, WorkflowEngine};
    pub use crate::job::{
        ErrorClass, ErrorInfo, Execution, ExecutionState, Job, JobState, PerformOutcome,
    };
    pub use crate::persistence::{MemoryStore, Store};
    pub use crate::registry::{HandlerRegistry, JobContext};
    pub use crate::reliability::{Backoff, RetryPolicy};
    pub use crate::schedule::Schedule;
    pub use crate::scheduler::{JobScheduler, SchedulerConfig};
    pub use crate::supervisor::Supervisor;
    pub use crate::workflow::{Step, Trigger, Workflow, WorkflowExecState};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{Coordinator, CoordinatorError, LockAcquire, SingleNodeCoordinator,
    StoreBackedCoordinator};
pub use config::{Config, ConfigError, PeerMode, StoreChoice};
pub use dispatch::{DispatchError, Dispatcher, DispatcherConfig, JobRun, QueueStats, RunSink};
pub use dlq::{classify, DeadLetterConfig, DeadLetterPipeline, DlqError};
pub use engine::{EngineConfig, EngineError, WorkflowEngine};
pub use job::{ErrorClass, ErrorInfo, Execution, ExecutionState, Job, JobState, PerformOutcome};
pub use persistence::{DeadLetterEntry, MemoryStore, Store, StoreError};
pub use registry::{HandlerRegistry, JobContext, JobHandler};
pub use reliability::{Backoff, RetryPolicy};
pub use schedule::{Schedule, ScheduleError};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerError};
pub use supervisor::{Supervisor, SupervisorError};
pub use workflow::{
    Step, Trigger, Workflow, WorkflowBuilder, WorkflowError, WorkflowExecState, WorkflowExecution,
};
