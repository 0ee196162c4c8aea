//! Job scheduler
//!
//! A timer loop that runs only on the cluster leader. Every tick it scans
//! the store for due jobs, takes the job's unique lock, records an
//! execution, pushes a run envelope onto the dispatcher, and immediately
//! recomputes `next_run_at` so a long-running attempt cannot starve the
//! next tick. A companion sweeper ages out orphaned `running` executions
//! left behind by crashed nodes.

mod finalizer;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::cluster::{Coordinator, CoordinatorError, LockAcquire};
use crate::dispatch::{DispatchError, Dispatcher, JobRun, RunLock};
use crate::job::{ErrorInfo, Execution, ExecutionState, Job, JobError, JobState};
use crate::persistence::{JobChanges, JobFilter, Pagination, Store, StoreError};
use crate::schedule::ScheduleError;
use crate::util::to_chrono;

pub use finalizer::{FailureCounters, Finalizer};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period of the due-job scan.
    pub poll_interval: Duration,

    /// Maximum jobs considered per tick.
    pub due_batch_limit: usize,

    /// Added to the job timeout when sizing the dispatch lock TTL.
    pub lock_safety_margin: Duration,

    /// Consecutive dead-lettered firings before a job trips to `Failed`.
    pub failure_trip_threshold: u32,

    /// Tick period of the orphaned-execution sweeper.
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            due_batch_limit: 100,
            lock_safety_margin: Duration::from_secs(30),
            failure_trip_threshold: 10,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_safety_margin(mut self, margin: Duration) -> Self {
        self.lock_safety_margin = margin;
        self
    }

    pub fn with_failure_trip_threshold(mut self, threshold: u32) -> Self {
        self.failure_trip_threshold = threshold.max(1);
        self
    }
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("job error: {0}")]
    Job(#[from] JobError),
}

/// What happened to one due job during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Execution recorded and pushed; carries the execution id.
    Dispatched(Uuid),
    /// Another node (or a still-running attempt) holds the lock; the job
    /// stays due and is reconsidered next tick.
    Locked,
    /// The queue refused the push; `next_run_at` stays unchanged.
    QueueFull,
}

/// Leader-only polling scheduler plus job administration facade.
pub struct JobScheduler {
    store: Arc<dyn Store>,
    coordinator: Arc<dyn Coordinator>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    node_id: String,
    config: SchedulerConfig,
    failures: FailureCounters,
    shutdown: CancellationToken,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        coordinator: Arc<dyn Coordinator>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        node_id: impl Into<String>,
        config: SchedulerConfig,
        failures: FailureCounters,
    ) -> Self {
        Self {
            store,
            coordinator,
            dispatcher,
            clock,
            node_id: node_id.into(),
            config,
            failures,
            shutdown: CancellationToken::new(),
            poll_handle: Mutex::new(None),
            sweep_handle: Mutex::new(None),
        }
    }

    // =========================================================================
    // Job administration
    // =========================================================================

    /// Register a job, seeding its first `next_run_at` from the clock.
    pub async fn register(&self, mut job: Job) -> Result<(), SchedulerError> {
        job.next_run_at = job.schedule.first_run_at(self.clock.now())?;
        self.store.register_job(job).await?;
        Ok(())
    }

    /// Pause: the job stays registered but is skipped by the scan.
    pub async fn pause_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.store
            .update_job(
                name,
                JobChanges::default().paused(true).state(JobState::Paused),
            )
            .await?;
        Ok(())
    }

    /// Resume a paused job.
    pub async fn resume_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.store
            .update_job(
                name,
                JobChanges::default().paused(false).state(JobState::Active),
            )
            .await?;
        Ok(())
    }

    /// Disable: stronger than pause, survives resume.
    pub async fn disable_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.store
            .update_job(
                name,
                JobChanges::default()
                    .enabled(false)
                    .state(JobState::Disabled),
            )
            .await?;
        Ok(())
    }

    /// Re-enable a disabled job.
    pub async fn enable_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.store
            .update_job(
                name,
                JobChanges::default().enabled(true).state(JobState::Active),
            )
            .await?;
        Ok(())
    }

    /// Bring a job back from `Failed` and clear its failure strikes.
    pub async fn revive_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.failures.remove(name);
        self.store
            .update_job(name, JobChanges::default().state(JobState::Active))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the poll and sweep loops.
    pub fn start(self: Arc<Self>) {
        let this = Arc::clone(&self);
        let poll = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.poll_tick().await,
                    _ = this.shutdown.cancelled() => break,
                }
            }
            debug!("scheduler poll loop exited");
        });
        *self.poll_handle.lock() = Some(poll);

        let this = Arc::clone(&self);
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.sweep_tick().await,
                    _ = this.shutdown.cancelled() => break,
                }
            }
            debug!("scheduler sweep loop exited");
        });
        *self.sweep_handle.lock() = Some(sweep);

        info!(node_id = %self.node_id, "scheduler started");
    }

    /// Stop enqueuing new work.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Dispatch every runnable reboot job exactly once. Called by the
    /// supervisor at startup; reboot jobs never get a `next_run_at`, so
    /// the poll loop ignores them afterwards.
    pub async fn dispatch_reboot_jobs(&self) -> Result<usize, SchedulerError> {
        let jobs = self
            .store
            .list_jobs(
                JobFilter::default(),
                Pagination {
                    offset: 0,
                    limit: usize::MAX,
                },
            )
            .await?;

        let mut dispatched = 0;
        for job in jobs
            .iter()
            .filter(|j| j.schedule.is_reboot() && j.is_runnable())
        {
            match self.dispatch_job(job).await {
                Ok(DispatchDecision::Dispatched(_)) => dispatched += 1,
                Ok(other) => debug!(job = %job.name, ?other, "reboot job not dispatched"),
                Err(e) => warn!(job = %job.name, "reboot dispatch failed: {e}"),
            }
        }
        Ok(dispatched)
    }

    // =========================================================================
    // Poll loop
    // =========================================================================

    /// One scan: only on the leader; errors are logged, never fatal.
    pub async fn poll_tick(&self) {
        if !self.coordinator.is_leader().await {
            return;
        }
        let now = self.clock.now();
        let due = match self
            .store
            .get_due_jobs(now, None, self.config.due_batch_limit)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!("due-job scan failed: {e}");
                return;
            }
        };

        for job in due {
            if let Err(e) = self.dispatch_job(&job).await {
                warn!(job = %job.name, "dispatch failed: {e}");
            }
        }
    }

    /// Dispatch one due job: lock, record the execution, push, recompute
    /// the next run.
    #[instrument(skip(self, job), fields(job = %job.name))]
    pub async fn dispatch_job(&self, job: &Job) -> Result<DispatchDecision, SchedulerError> {
        let now = self.clock.now();
        let ttl = job.timeout + self.config.lock_safety_margin;

        let execution = Execution::begin(&job.name, 1, &self.node_id, now);
        let execution_id = execution.id;
        // The lock owner is the attempt, not the node: a still-running
        // attempt on this same node must also turn the dispatch away.
        let lock_owner = execution_id.to_string();

        // The job lock serializes dispatch across the cluster. For unique
        // jobs it is held until the attempt finalizes; otherwise it only
        // covers this dispatch.
        match self
            .coordinator
            .try_acquire(&job.name, &lock_owner, ttl)
            .await?
        {
            LockAcquire::Locked => {
                debug!("job lock taken, leaving next_run_at unchanged");
                return Ok(DispatchDecision::Locked);
            }
            LockAcquire::Acquired => {}
        }

        if let Err(e) = self.store.record_execution_start(execution.clone()).await {
            self.release_lock(&job.name, &lock_owner).await;
            return Err(e.into());
        }

        let lock = if job.unique {
            RunLock::Held {
                key: job.name.clone(),
            }
        } else {
            RunLock::None
        };
        let run = JobRun::for_job(job, execution_id).with_lock(lock);

        if let Err(push_err) = self.dispatcher.push(run) {
            // The work never entered a queue: finalize the execution,
            // release the lock, and leave next_run_at unchanged so the
            // next tick reconsiders the job.
            let mut cancelled = execution;
            cancelled.state = ExecutionState::Cancelled;
            cancelled.completed_at = Some(self.clock.now());
            cancelled.error = Some(ErrorInfo::retryable(push_err.to_string()));
            if let Err(e) = self.store.record_execution_complete(cancelled).await {
                warn!("failed to finalize rejected execution: {e}");
            }
            self.release_lock(&job.name, &lock_owner).await;
            debug!("queue rejected push: {push_err}");
            return Ok(DispatchDecision::QueueFull);
        }

        // Recompute immediately so the next firing is visible before this
        // attempt finishes.
        match job.schedule.next_after(now) {
            Ok(next) => {
                self.store
                    .update_job(&job.name, JobChanges::default().next_run_at(next))
                    .await?;
            }
            Err(e) => {
                // A schedule that stopped evaluating is structural; park
                // the job rather than re-dispatching it every tick.
                error!(job = %job.name, "schedule evaluation failed, failing job: {e}");
                self.store
                    .mark_failed(&job.name, ErrorInfo::permanent(e.to_string()), None)
                    .await?;
                self.store
                    .update_job(
                        &job.name,
                        JobChanges::default()
                            .state(JobState::Failed)
                            .next_run_at(None),
                    )
                    .await?;
            }
        }

        if !job.unique {
            self.release_lock(&job.name, &lock_owner).await;
        }

        Ok(DispatchDecision::Dispatched(execution_id))
    }

    // =========================================================================
    // Sweeper
    // =========================================================================

    /// Age out orphaned `running` executions after twice the job timeout.
    pub async fn sweep_tick(&self) {
        let now = self.clock.now();
        let running = match self.store.list_running_executions().await {
            Ok(running) => running,
            Err(e) => {
                error!("sweep scan failed: {e}");
                return;
            }
        };

        for exec in running {
            let budget = match self.store.get_job(&exec.job_name).await {
                Ok(job) => job.timeout * 2,
                // The job is gone; sweep with a conservative default.
                Err(_) => Duration::from_secs(600),
            };
            let age = now.signed_duration_since(exec.started_at);
            if age <= to_chrono(budget) {
                continue;
            }

            warn!(
                job = %exec.job_name,
                execution = %exec.id,
                "sweeping orphaned execution"
            );
            let mut swept = exec.clone();
            swept.state = ExecutionState::Failed;
            swept.completed_at = Some(now);
            swept.error = Some(ErrorInfo::timeout(
                "orphaned execution aged out by sweeper",
            ));
            if let Err(e) = self.store.record_execution_complete(swept).await {
                warn!("failed to finalize swept execution: {e}");
                continue;
            }
            if let Err(e) = self
                .store
                .mark_failed(
                    &exec.job_name,
                    ErrorInfo::timeout("orphaned execution aged out by sweeper"),
                    None,
                )
                .await
            {
                warn!("failed to record swept failure: {e}");
            }
            // The dead attempt owned the lock; release it so the next
            // tick can redispatch without waiting out the TTL.
            self.release_lock(&exec.job_name, &exec.id.to_string()).await;
        }
    }

    async fn release_lock(&self, key: &str, owner: &str) {
        if let Err(e) = self.coordinator.release(key, owner).await {
            warn!(key, "lock release failed: {e}");
        }
    }
}
