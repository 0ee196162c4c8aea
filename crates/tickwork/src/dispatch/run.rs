//! Job-run envelope and completion contract

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::job::{ErrorInfo, Job};

/// What kind of work a run carries; step completions route back to the
/// workflow engine instead of the job finalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunKind {
    /// A scheduled (or replayed) job attempt.
    Job,
    /// One step of a workflow execution.
    Step {
        workflow_execution: Uuid,
        step: String,
    },
}

/// Unique-lock disposition for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunLock {
    /// Not a unique run.
    None,
    /// The scheduler acquired `key` before pushing; the finalizer releases
    /// it.
    Held { key: String },
    /// The worker must acquire `key` at dispatch and abandon the run if it
    /// is taken (dead-letter replays, shadow retries).
    Acquire { key: String },
}

impl RunLock {
    /// Key to release at finalization, if any lock was involved.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Held { key } | Self::Acquire { key } => Some(key),
        }
    }
}

/// Everything a worker needs to run one attempt.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub execution_id: Uuid,
    pub job_name: String,
    pub handler: String,
    pub args: Value,
    pub queue: String,
    pub priority: u8,
    /// 1-based within this firing; shadow retries increment it.
    pub attempt: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    pub lock: RunLock,
    pub kind: RunKind,
    /// First failure of this firing, carried across retries for the
    /// dead-letter record.
    pub first_failed_at: Option<DateTime<Utc>>,
}

impl JobRun {
    /// Envelope for a job's first attempt of a firing.
    pub fn for_job(job: &Job, execution_id: Uuid) -> Self {
        Self {
            execution_id,
            job_name: job.name.clone(),
            handler: job.handler.clone(),
            args: job.args.clone(),
            queue: job.queue.clone(),
            priority: job.priority,
            attempt: 1,
            max_retries: job.max_retries,
            timeout: job.timeout,
            lock: RunLock::None,
            kind: RunKind::Job,
            first_failed_at: None,
        }
    }

    pub fn with_lock(mut self, lock: RunLock) -> Self {
        self.lock = lock;
        self
    }

    /// Envelope for the retry that follows this failed attempt.
    ///
    /// A held lock is downgraded to acquire-on-dispatch: the finalizer
    /// releases the original lock, and the retry competes for it again.
    pub fn next_attempt(&self, execution_id: Uuid, failed_at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.execution_id = execution_id;
        next.attempt += 1;
        next.first_failed_at = Some(self.first_failed_at.unwrap_or(failed_at));
        next.lock = match &self.lock {
            RunLock::None => RunLock::None,
            RunLock::Held { key } | RunLock::Acquire { key } => {
                RunLock::Acquire { key: key.clone() }
            }
        };
        next
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunVerdict {
    /// Body returned ok; payload becomes `last_result`.
    Success(Option<Value>),
    /// Body failed with a classified error.
    Failure(ErrorInfo),
    /// Body asked for a retry with an explicit delay.
    RetryRequested { delay: Duration },
    /// Cancellation signal observed (operator, shutdown, or body).
    Cancelled { reason: String },
    /// Attempt exceeded its timeout budget.
    TimedOut,
    /// Body asked to drop the work without retry or dead-letter.
    Discarded { reason: String },
}

/// Result of one attempt, handed to the completion sink.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub verdict: RunVerdict,
}

/// Where finished runs go.
///
/// The supervisor installs a router that sends job runs to the scheduler's
/// finalizer and step runs to the workflow engine.
#[async_trait]
pub trait RunSink: Send + Sync + 'static {
    async fn on_outcome(&self, run: JobRun, outcome: RunOutcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_attempt_increments_and_downgrades_lock() {
        let job = Job::builder("sync", "sync.run").build().unwrap();
        let run = JobRun::for_job(&job, Uuid::now_v7()).with_lock(RunLock::Held {
            key: "sync".into(),
        });

        let failed_at = Utc::now();
        let retry = run.next_attempt(Uuid::now_v7(), failed_at);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.first_failed_at, Some(failed_at));
        assert_eq!(
            retry.lock,
            RunLock::Acquire {
                key: "sync".into()
            }
        );

        // first_failed_at sticks to the original failure.
        let retry2 = retry.next_attempt(Uuid::now_v7(), Utc::now());
        assert_eq!(retry2.attempt, 3);
        assert_eq!(retry2.first_failed_at, Some(failed_at));
    }

    #[test]
    fn lock_key_exposed_for_release() {
        assert_eq!(RunLock::None.key(), None);
        assert_eq!(
            RunLock::Held { key: "a".into() }.key(),
            Some("a")
        );
        assert_eq!(
            RunLock::Acquire { key: "b".into() }.key(),
            Some("b")
        );
    }
}
