//! Store trait definition

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{ErrorClass, ErrorInfo, Execution, Job, JobState};
use crate::schedule::Schedule;
use crate::workflow::{Workflow, WorkflowExecution};

/// Error type for store operations.
///
/// `Transient` failures may be retried by the caller; `Permanent` ones must
/// not be.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write conflicted with an existing row.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend hiccup; the caller may retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Unrecoverable backend error.
    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Whether the caller should retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result of a conditional lock insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAcquire {
    /// The caller now holds the lock.
    Acquired,
    /// Another owner holds a live lock.
    Locked,
}

/// Pagination parameters.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub state: Option<JobState>,
    pub enabled: Option<bool>,
    pub tag: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.queue.as_ref().map_or(true, |q| *q == job.queue)
            && self.state.map_or(true, |s| s == job.state)
            && self.enabled.map_or(true, |e| e == job.enabled)
            && self
                .tag
                .as_ref()
                .map_or(true, |t| job.tags.iter().any(|tag| tag == t))
    }
}

/// Partial update applied to a job in place.
#[derive(Debug, Clone, Default)]
pub struct JobChanges {
    pub enabled: Option<bool>,
    pub paused: Option<bool>,
    pub state: Option<JobState>,
    pub priority: Option<u8>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub schedule: Option<Schedule>,
    pub args: Option<serde_json::Value>,
    /// `Some(None)` clears the next run; `None` leaves it untouched.
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

impl JobChanges {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = Some(paused);
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn next_run_at(mut self, next: Option<DateTime<Utc>>) -> Self {
        self.next_run_at = Some(next);
        self
    }
}

/// Filter for listing dead-letter entries.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub job_name: Option<String>,
    pub queue: Option<String>,
    pub class: Option<ErrorClass>,
}

impl DlqFilter {
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.job_name.as_ref().map_or(true, |n| *n == entry.job_name)
            && self.queue.as_ref().map_or(true, |q| *q == entry.queue)
            && self.class.map_or(true, |c| c == entry.error.class)
    }
}

/// Archived terminally-failed work.
///
/// Entries are append-only historical records until explicitly deleted or
/// pruned; replaying one does not mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub job_name: String,
    pub queue: String,
    pub error: ErrorInfo,
    /// Total attempts made before archiving.
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    /// Original arguments, for replay.
    pub args: serde_json::Value,
}

/// Persistent surface shared by every node.
///
/// Implementations must be thread-safe and linearize the conditional lock
/// insert: "insert iff no row exists, the existing row expired, or the
/// caller already owns it".
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // =========================================================================
    // Jobs
    // =========================================================================

    /// Persist a new job. Fails with `Conflict` if the name is taken.
    async fn register_job(&self, job: Job) -> Result<(), StoreError>;

    async fn get_job(&self, name: &str) -> Result<Job, StoreError>;

    async fn list_jobs(&self, filter: JobFilter, page: Pagination)
        -> Result<Vec<Job>, StoreError>;

    async fn update_job(&self, name: &str, changes: JobChanges) -> Result<(), StoreError>;

    async fn delete_job(&self, name: &str) -> Result<(), StoreError>;

    /// Runnable jobs whose `next_run_at <= now`, ordered by `next_run_at`
    /// then priority.
    async fn get_due_jobs(
        &self,
        now: DateTime<Utc>,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Record a successful attempt: bumps `run_count`, sets `last_result`
    /// and `last_run_at`. `next_run_at` of `Some` overwrites; `None`
    /// leaves the dispatch-time value in place.
    async fn mark_completed(
        &self,
        name: &str,
        result: Option<serde_json::Value>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt: bumps `error_count`, sets `last_error` and
    /// `last_run_at`.
    async fn mark_failed(
        &self,
        name: &str,
        error: ErrorInfo,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Unique locks
    // =========================================================================

    /// Conditional insert: acquires when no live lock exists or the caller
    /// already owns the key (renewal). A lock whose expiry passed is
    /// replaced atomically.
    async fn acquire_unique_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, StoreError>;

    /// No-op if the caller is not the current holder.
    async fn release_unique_lock(&self, key: &str, owner: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Executions
    // =========================================================================

    async fn record_execution_start(&self, exec: Execution) -> Result<(), StoreError>;

    async fn record_execution_complete(&self, exec: Execution) -> Result<(), StoreError>;

    /// Executions for a job, newest first.
    async fn list_executions(
        &self,
        job_name: &str,
        page: Pagination,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Executions still in `Running`, for the orphan sweeper.
    async fn list_running_executions(&self) -> Result<Vec<Execution>, StoreError>;

    // =========================================================================
    // Workflows
    // =========================================================================

    /// Insert or replace a workflow definition.
    async fn register_workflow(&self, workflow: Arc<Workflow>) -> Result<(), StoreError>;

    async fn get_workflow(&self, name: &str) -> Result<Arc<Workflow>, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<Arc<Workflow>>, StoreError>;

    async fn delete_workflow(&self, name: &str) -> Result<(), StoreError>;

    async fn record_workflow_start(&self, exec: WorkflowExecution) -> Result<(), StoreError>;

    async fn record_workflow_update(&self, exec: WorkflowExecution) -> Result<(), StoreError>;

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    async fn list_running_workflow_executions(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    // =========================================================================
    // Dead letters
    // =========================================================================

    async fn insert_dlq(&self, entry: DeadLetterEntry) -> Result<(), StoreError>;

    async fn list_dlq(
        &self,
        filter: DlqFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn get_dlq(&self, id: Uuid) -> Result<DeadLetterEntry, StoreError>;

    async fn delete_dlq(&self, id: Uuid) -> Result<(), StoreError>;

    /// Remove entries older than `before` and/or beyond `max_entries`,
    /// keeping the most recent. Returns how many were removed.
    async fn prune_dlq(
        &self,
        before: Option<DateTime<Utc>>,
        max_entries: Option<usize>,
    ) -> Result<usize, StoreError>;
}
