//! Job and execution data model
//!
//! A [`Job`] is a named, persistent definition of recurring (or one-shot)
//! work: what to run, when, on which queue, and how to handle failure. An
//! [`Execution`] is one attempt of that work. Both are owned by the store;
//! the scheduler and dispatcher only ever mutate them through it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::RetryPolicy;
use crate::schedule::Schedule;

/// Errors raised while building a job definition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// Job names are lowercase alphanumerics and underscores.
    #[error("invalid job name {0:?}: expected [a-z0-9_]+")]
    InvalidName(String),

    /// Priorities range 0 (highest) through 9 (lowest).
    #[error("priority {0} out of range (0-9)")]
    PriorityOutOfRange(u8),

    /// Per-attempt timeout must be non-zero.
    #[error("job timeout must be non-zero")]
    ZeroTimeout,
}

/// Coarse job lifecycle state.
///
/// `Failed` is entered after too many consecutive terminal failures and
/// requires an explicit revive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Active,
    Paused,
    Disabled,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Disabled => write!(f, "disabled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Classification of a terminal error, used for retry decisions and
/// dead-letter triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Attempt exceeded its time budget.
    Timeout,
    /// Downstream asked us to back off.
    RateLimited,
    /// Transient; the default for unclassified errors.
    Retryable,
    /// Structural: retrying cannot help (unknown handler, bad args).
    Permanent,
    /// Escape hatch for errors with no usable information.
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Retryable => write!(f, "retryable"),
            Self::Permanent => write!(f, "permanent"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A classified error carried on executions and dead-letter entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub class: ErrorClass,
    pub message: String,
    pub stacktrace: Option<String>,
}

impl ErrorInfo {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            stacktrace: None,
        }
    }

    /// Transient error with the default class.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Retryable, message)
    }

    /// Structural error; never retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, message)
    }

    /// Attempt exceeded its budget.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn with_stacktrace(mut self, trace: impl Into<String>) -> Self {
        self.stacktrace = Some(trace.into());
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

/// What a job body may return.
///
/// The worker finalizer switches on the tag: `Retry` overrides the job's
/// backoff delay for the next attempt, `Cancel` and `Discard` finalize the
/// attempt without counting it as a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum PerformOutcome {
    /// Success with no result payload.
    Ok,
    /// Success with a result persisted as `last_result`.
    OkWith(serde_json::Value),
    /// Failure; the message is classified by the dead-letter pipeline.
    Error(String),
    /// Explicit retry directive with a caller-chosen delay.
    Retry(Duration),
    /// Stop this attempt and mark it cancelled.
    Cancel(String),
    /// Drop the work without retrying or dead-lettering.
    Discard(String),
}

/// A named, persistent job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique short name; also the unique-lock key.
    pub name: String,

    /// Stable handler id resolved through the handler registry at dispatch.
    pub handler: String,

    /// Opaque arguments passed to every attempt.
    pub args: serde_json::Value,

    /// When the job fires.
    pub schedule: Schedule,

    /// Queue the job dispatches onto.
    pub queue: String,

    /// 0 (highest) through 9 (lowest).
    pub priority: u8,

    /// Retries after the initial attempt before dead-lettering.
    pub max_retries: u32,

    /// Backoff policy between retries.
    pub retry: RetryPolicy,

    /// Per-attempt budget enforced by the worker.
    #[serde(with = "crate::util::duration_millis")]
    pub timeout: Duration,

    /// At most one concurrent attempt when set. Defaults on for interval
    /// jobs.
    pub unique: bool,

    pub enabled: bool,
    pub paused: bool,
    pub state: JobState,

    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,

    // Runtime counters, maintained by the store.
    pub run_count: u64,
    pub error_count: u64,
    pub last_result: Option<serde_json::Value>,
    pub last_error: Option<ErrorInfo>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Start building a job. `handler` is the registry id of the code to
    /// run.
    pub fn builder(name: impl Into<String>, handler: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name, handler)
    }

    /// True when the scheduler may dispatch this job.
    pub fn is_runnable(&self) -> bool {
        self.enabled && !self.paused && self.state == JobState::Active
    }
}

/// Builder for [`Job`]; validation happens in [`JobBuilder::build`].
#[derive(Debug, Clone)]
pub struct JobBuilder {
    name: String,
    handler: String,
    args: serde_json::Value,
    schedule: Schedule,
    queue: String,
    priority: u8,
    max_retries: u32,
    retry: RetryPolicy,
    timeout: Duration,
    unique: Option<bool>,
    enabled: bool,
    tags: Vec<String>,
    metadata: HashMap<String, serde_json::Value>,
}

impl JobBuilder {
    fn new(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            args: serde_json::Value::Null,
            schedule: Schedule::OneShot { at: None },
            queue: "default".to_string(),
            priority: 5,
            max_retries: 0,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
            unique: None,
            enabled: true,
            tags: vec![],
            metadata: HashMap::new(),
        }
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = Some(unique);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Validate and produce the job. `next_run_at` is seeded later, at
    /// registration, because it needs a clock.
    pub fn build(self) -> Result<Job, JobError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(JobError::InvalidName(self.name));
        }
        if self.priority > 9 {
            return Err(JobError::PriorityOutOfRange(self.priority));
        }
        if self.timeout.is_zero() {
            return Err(JobError::ZeroTimeout);
        }

        let unique = self.unique.unwrap_or_else(|| self.schedule.is_interval());
        let epoch = DateTime::<Utc>::UNIX_EPOCH;

        Ok(Job {
            name: self.name,
            handler: self.handler,
            args: self.args,
            schedule: self.schedule,
            queue: self.queue,
            priority: self.priority,
            max_retries: self.max_retries,
            retry: self.retry,
            timeout: self.timeout,
            unique,
            enabled: self.enabled,
            paused: false,
            state: JobState::Active,
            tags: self.tags,
            metadata: self.metadata,
            run_count: 0,
            error_count: 0,
            last_result: None,
            last_error: None,
            last_run_at: None,
            next_run_at: None,
            created_at: epoch,
            updated_at: epoch,
        })
    }
}

/// State of one attempt. Every execution leaves `Running` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_name: String,
    /// 1-based within a firing; retries increment it.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: ExecutionState,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    /// Node that dispatched the attempt.
    pub node_id: String,
}

impl Execution {
    /// A fresh running execution.
    pub fn begin(
        job_name: impl Into<String>,
        attempt: u32,
        node_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_name: job_name.into(),
            attempt,
            started_at: now,
            completed_at: None,
            state: ExecutionState::Running,
            result: None,
            error: None,
            node_id: node_id.into(),
        }
    }
}
