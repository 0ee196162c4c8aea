//! Attempt finalization
//!
//! The finalizer is the dispatcher's completion sink for job runs: it
//! writes the terminal execution record, updates job counters, schedules
//! shadow retries, forwards exhausted failures to the dead-letter
//! pipeline, and releases the unique lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::cluster::Coordinator;
use crate::dispatch::{Dispatcher, JobRun, RunKind, RunOutcome, RunSink, RunVerdict};
use crate::dlq::DeadLetterPipeline;
use crate::job::{ErrorClass, ErrorInfo, Execution, ExecutionState};
use crate::persistence::{Store, StoreError};

/// Consecutive dead-lettered firings per job, shared with the scheduler so
/// `revive_job` can clear the strikes.
pub type FailureCounters = Arc<DashMap<String, u32>>;

/// How many times a failed store finalization is retried before giving up
/// and letting the sweeper recover the execution.
const STORE_RETRIES: u32 = 3;

/// Completion sink for job runs.
pub struct Finalizer {
    store: Arc<dyn Store>,
    coordinator: Arc<dyn Coordinator>,
    dispatcher: Arc<Dispatcher>,
    dlq: Arc<DeadLetterPipeline>,
    clock: Arc<dyn Clock>,
    node_id: String,
    failure_trip_threshold: u32,
    failures: FailureCounters,
    shutdown: CancellationToken,
}

impl Finalizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        coordinator: Arc<dyn Coordinator>,
        dispatcher: Arc<Dispatcher>,
        dlq: Arc<DeadLetterPipeline>,
        clock: Arc<dyn Clock>,
        node_id: impl Into<String>,
        failure_trip_threshold: u32,
        failures: FailureCounters,
    ) -> Self {
        Self {
            store,
            coordinator,
            dispatcher,
            dlq,
            clock,
            node_id: node_id.into(),
            failure_trip_threshold,
            failures,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop scheduling shadow retries (shutdown).
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn finalize(&self, run: JobRun, outcome: RunOutcome) {
        match &outcome.verdict {
            RunVerdict::Success(result) => {
                self.record_terminal(
                    &run,
                    &outcome,
                    ExecutionState::Succeeded,
                    result.clone(),
                    None,
                )
                .await;
                if let Err(e) = self
                    .store
                    .mark_completed(&run.job_name, result.clone(), None)
                    .await
                {
                    warn!(job = %run.job_name, "mark_completed failed: {e}");
                }
                self.failures.remove(&run.job_name);
            }

            RunVerdict::Failure(error) => {
                self.handle_failure(&run, &outcome, error.clone(), ExecutionState::Failed, None)
                    .await;
            }

            RunVerdict::TimedOut => {
                let error = ErrorInfo::timeout(format!(
                    "attempt exceeded its {}ms budget",
                    run.timeout.as_millis()
                ));
                self.handle_failure(&run, &outcome, error, ExecutionState::TimedOut, None)
                    .await;
            }

            RunVerdict::RetryRequested { delay } => {
                let error = ErrorInfo::retryable("retry requested by worker");
                self.handle_failure(
                    &run,
                    &outcome,
                    error,
                    ExecutionState::Failed,
                    Some(*delay),
                )
                .await;
            }

            RunVerdict::Cancelled { reason } => {
                self.record_terminal(
                    &run,
                    &outcome,
                    ExecutionState::Cancelled,
                    None,
                    Some(ErrorInfo::new(ErrorClass::Unknown, reason.clone())),
                )
                .await;
            }

            RunVerdict::Discarded { reason } => {
                debug!(job = %run.job_name, reason, "attempt discarded by worker");
                self.record_terminal(
                    &run,
                    &outcome,
                    ExecutionState::Cancelled,
                    None,
                    Some(ErrorInfo::new(
                        ErrorClass::Unknown,
                        format!("discarded: {reason}"),
                    )),
                )
                .await;
            }
        }

        // The lock outlives every store write so a concurrent tick cannot
        // double-dispatch while finalization is in flight. Locks are owned
        // by the attempt, so release with the execution id.
        if let Some(key) = run.lock.key() {
            let owner = run.execution_id.to_string();
            if let Err(e) = self.coordinator.release(key, &owner).await {
                warn!(key, "lock release failed: {e}");
            }
        }
    }

    /// Failure path: record, count, then retry or dead-letter.
    async fn handle_failure(
        &self,
        run: &JobRun,
        outcome: &RunOutcome,
        error: ErrorInfo,
        state: ExecutionState,
        delay_override: Option<Duration>,
    ) {
        self.record_terminal(run, outcome, state, None, Some(error.clone()))
            .await;
        if let Err(e) = self
            .store
            .mark_failed(&run.job_name, error.clone(), None)
            .await
        {
            warn!(job = %run.job_name, "mark_failed failed: {e}");
        }

        let retryable = error.class != ErrorClass::Permanent;
        if retryable && run.attempt <= run.max_retries {
            let delay = match delay_override {
                Some(delay) => delay,
                // The backoff policy lives on the job; a job deleted
                // mid-flight falls back to a flat second.
                None => match self.store.get_job(&run.job_name).await {
                    Ok(job) => job.retry.delay_after_attempt(run.attempt),
                    Err(_) => Duration::from_secs(1),
                },
            };
            self.schedule_retry(run, delay, outcome.completed_at);
            return;
        }

        // Exhausted (or structurally unretryable): archive and count the
        // strike.
        if let Err(e) = self.dlq.record(run, error, outcome.completed_at).await {
            error!(job = %run.job_name, "dead-letter record failed: {e}");
        }

        let strikes = {
            let mut entry = self.failures.entry(run.job_name.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if strikes >= self.failure_trip_threshold {
            warn!(
                job = %run.job_name,
                strikes,
                "consecutive failure threshold reached, failing job"
            );
            if let Err(e) = self
                .store
                .update_job(
                    &run.job_name,
                    crate::persistence::JobChanges::default()
                        .state(crate::job::JobState::Failed),
                )
                .await
            {
                warn!(job = %run.job_name, "failed to trip job state: {e}");
            }
        }
    }

    /// Spawn a timer that re-enqueues the run as a shadow execution. The
    /// job's own `next_run_at` is untouched.
    fn schedule_retry(&self, run: &JobRun, delay: Duration, failed_at: DateTime<Utc>) {
        let next = run.next_attempt(Uuid::now_v7(), failed_at);
        debug!(
            job = %next.job_name,
            attempt = next.attempt,
            delay_ms = delay.as_millis(),
            "scheduling retry"
        );

        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let clock = Arc::clone(&self.clock);
        let node_id = self.node_id.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }

            let execution = Execution {
                id: next.execution_id,
                job_name: next.job_name.clone(),
                attempt: next.attempt,
                started_at: clock.now(),
                completed_at: None,
                state: ExecutionState::Running,
                result: None,
                error: None,
                node_id,
            };
            if let Err(e) = store.record_execution_start(execution).await {
                error!(job = %next.job_name, "failed to record retry execution: {e}");
                return;
            }
            let job_name = next.job_name.clone();
            if let Err(e) = dispatcher.push(next) {
                warn!(job = %job_name, "retry push rejected: {e}");
            }
        });
    }

    /// Write the terminal execution record, retrying transient store
    /// failures a bounded number of times. If the store stays down the
    /// sweeper recovers the orphaned row later.
    async fn record_terminal(
        &self,
        run: &JobRun,
        outcome: &RunOutcome,
        state: ExecutionState,
        result: Option<serde_json::Value>,
        error: Option<ErrorInfo>,
    ) {
        let execution = Execution {
            id: run.execution_id,
            job_name: run.job_name.clone(),
            attempt: run.attempt,
            started_at: outcome.started_at,
            completed_at: Some(outcome.completed_at),
            state,
            result,
            error,
            node_id: self.node_id.clone(),
        };

        for attempt in 1..=STORE_RETRIES {
            match self.store.record_execution_complete(execution.clone()).await {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < STORE_RETRIES => {
                    warn!(execution = %execution.id, "transient store error, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                Err(StoreError::NotFound(_)) => {
                    // The start record never landed (or was pruned); write
                    // the whole terminal row instead of losing the attempt.
                    if let Err(e) = self.store.record_execution_start(execution.clone()).await {
                        error!(execution = %execution.id, "failed to backfill execution: {e}");
                    }
                    return;
                }
                Err(e) => {
                    error!(
                        execution = %execution.id,
                        "giving up on execution finalization: {e}"
                    );
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl RunSink for Finalizer {
    async fn on_outcome(&self, run: JobRun, outcome: RunOutcome) {
        match run.kind {
            RunKind::Job => self.finalize(run, outcome).await,
            RunKind::Step { .. } => {
                // The router owns step completions; reaching here is a
                // wiring bug.
                error!(job = %run.job_name, "finalizer received a workflow step run");
            }
        }
    }
}
