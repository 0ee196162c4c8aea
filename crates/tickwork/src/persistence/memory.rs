//! In-memory implementation of the store
//!
//! The primary test vehicle, but also a complete implementation: it honors
//! the same semantics SQL and key-value backends must provide, including
//! the conditional lock insert and due-job ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::job::{ErrorInfo, Execution, ExecutionState, Job};
use crate::util::to_chrono;
use crate::workflow::{Workflow, WorkflowExecState, WorkflowExecution};

use super::store::*;

/// A held unique lock.
#[derive(Debug, Clone)]
struct LockRow {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// In-memory store backed by parking_lot maps.
///
/// # Example
///
/// ```
/// use tickwork::persistence::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    jobs: RwLock<HashMap<String, Job>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    locks: RwLock<HashMap<String, LockRow>>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    workflow_execs: RwLock<HashMap<Uuid, WorkflowExecution>>,
    dlq: RwLock<HashMap<Uuid, DeadLetterEntry>>,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with an injected clock (tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            jobs: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            workflow_execs: RwLock::new(HashMap::new()),
            dlq: RwLock::new(HashMap::new()),
        }
    }

    /// Number of registered jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Number of recorded executions.
    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    /// Number of dead-letter entries.
    pub fn dlq_count(&self) -> usize {
        self.dlq.read().len()
    }

    /// Drop everything (tests).
    pub fn clear(&self) {
        self.jobs.write().clear();
        self.executions.write().clear();
        self.locks.write().clear();
        self.workflows.write().clear();
        self.workflow_execs.write().clear();
        self.dlq.write().clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_job(&self, mut job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.name) {
            return Err(StoreError::Conflict(format!(
                "job {:?} already registered",
                job.name
            )));
        }
        let now = self.clock.now();
        job.created_at = now;
        job.updated_at = now;
        jobs.insert(job.name.clone(), job);
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {name:?}")))
    }

    async fn list_jobs(
        &self,
        filter: JobFilter,
        page: Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read();
        let mut matching: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn update_job(&self, name: &str, changes: JobChanges) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("job {name:?}")))?;

        if let Some(enabled) = changes.enabled {
            job.enabled = enabled;
        }
        if let Some(paused) = changes.paused {
            job.paused = paused;
        }
        if let Some(state) = changes.state {
            job.state = state;
        }
        if let Some(priority) = changes.priority {
            job.priority = priority;
        }
        if let Some(max_retries) = changes.max_retries {
            job.max_retries = max_retries;
        }
        if let Some(timeout) = changes.timeout {
            job.timeout = timeout;
        }
        if let Some(schedule) = changes.schedule {
            job.schedule = schedule;
        }
        if let Some(args) = changes.args {
            job.args = args;
        }
        if let Some(next_run_at) = changes.next_run_at {
            job.next_run_at = next_run_at;
        }
        job.updated_at = self.clock.now();
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<(), StoreError> {
        self.jobs
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("job {name:?}")))
    }

    async fn get_due_jobs(
        &self,
        now: DateTime<Utc>,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read();
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.is_runnable()
                    && queue.map_or(true, |q| q == j.queue)
                    && j.next_run_at.map_or(false, |next| next <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then(a.priority.cmp(&b.priority))
                .then(a.name.cmp(&b.name))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_completed(
        &self,
        name: &str,
        result: Option<serde_json::Value>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("job {name:?}")))?;
        let now = self.clock.now();
        job.run_count += 1;
        job.last_result = result;
        job.last_error = None;
        job.last_run_at = Some(now);
        if let Some(next) = next_run_at {
            job.next_run_at = Some(next);
        }
        job.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        name: &str,
        error: ErrorInfo,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("job {name:?}")))?;
        let now = self.clock.now();
        job.error_count += 1;
        job.last_error = Some(error);
        job.last_run_at = Some(now);
        if let Some(next) = next_run_at {
            job.next_run_at = Some(next);
        }
        job.updated_at = now;
        Ok(())
    }

    async fn acquire_unique_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, StoreError> {
        if ttl.is_zero() {
            return Err(StoreError::Permanent(
                "lock ttl must be positive".to_string(),
            ));
        }
        let now = self.clock.now();
        let mut locks = self.locks.write();
        match locks.get(key) {
            Some(row) if row.expires_at > now && row.owner != owner => Ok(LockAcquire::Locked),
            _ => {
                locks.insert(
                    key.to_string(),
                    LockRow {
                        owner: owner.to_string(),
                        expires_at: now + to_chrono(ttl),
                    },
                );
                Ok(LockAcquire::Acquired)
            }
        }
    }

    async fn release_unique_lock(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let mut locks = self.locks.write();
        if locks.get(key).map_or(false, |row| row.owner == owner) {
            locks.remove(key);
        }
        Ok(())
    }

    async fn record_execution_start(&self, exec: Execution) -> Result<(), StoreError> {
        self.executions.write().insert(exec.id, exec);
        Ok(())
    }

    async fn record_execution_complete(&self, exec: Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        match executions.get(&exec.id) {
            None => Err(StoreError::NotFound(format!("execution {}", exec.id))),
            // Terminal states are written exactly once.
            Some(existing) if existing.state.is_terminal() => Err(StoreError::Conflict(format!(
                "execution {} already finalized",
                exec.id
            ))),
            Some(_) => {
                executions.insert(exec.id, exec);
                Ok(())
            }
        }
    }

    async fn list_executions(
        &self,
        job_name: &str,
        page: Pagination,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        let mut matching: Vec<Execution> = executions
            .values()
            .filter(|e| e.job_name == job_name)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn list_running_executions(&self) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .values()
            .filter(|e| e.state == ExecutionState::Running)
            .cloned()
            .collect())
    }

    async fn register_workflow(&self, workflow: Arc<Workflow>) -> Result<(), StoreError> {
        self.workflows
            .write()
            .insert(workflow.name.clone(), workflow);
        Ok(())
    }

    async fn get_workflow(&self, name: &str) -> Result<Arc<Workflow>, StoreError> {
        self.workflows
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow {name:?}")))
    }

    async fn list_workflows(&self) -> Result<Vec<Arc<Workflow>>, StoreError> {
        let mut workflows: Vec<Arc<Workflow>> = self.workflows.read().values().cloned().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    async fn delete_workflow(&self, name: &str) -> Result<(), StoreError> {
        self.workflows
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("workflow {name:?}")))
    }

    async fn record_workflow_start(&self, exec: WorkflowExecution) -> Result<(), StoreError> {
        self.workflow_execs.write().insert(exec.id, exec);
        Ok(())
    }

    async fn record_workflow_update(&self, exec: WorkflowExecution) -> Result<(), StoreError> {
        let mut execs = self.workflow_execs.write();
        if !execs.contains_key(&exec.id) {
            return Err(StoreError::NotFound(format!(
                "workflow execution {}",
                exec.id
            )));
        }
        execs.insert(exec.id, exec);
        Ok(())
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.workflow_execs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow execution {id}")))
    }

    async fn list_running_workflow_executions(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let execs = self.workflow_execs.read();
        let mut running: Vec<WorkflowExecution> = execs
            .values()
            .filter(|e| {
                matches!(
                    e.state,
                    WorkflowExecState::Running | WorkflowExecState::Paused
                ) && workflow.map_or(true, |w| w == e.workflow)
            })
            .cloned()
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        running.truncate(limit);
        Ok(running)
    }

    async fn insert_dlq(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        self.dlq.write().insert(entry.id, entry);
        Ok(())
    }

    async fn list_dlq(
        &self,
        filter: DlqFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let dlq = self.dlq.read();
        let mut matching: Vec<DeadLetterEntry> =
            dlq.values().filter(|e| filter.matches(e)).cloned().collect();
        matching.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn get_dlq(&self, id: Uuid) -> Result<DeadLetterEntry, StoreError> {
        self.dlq
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))
    }

    async fn delete_dlq(&self, id: Uuid) -> Result<(), StoreError> {
        self.dlq
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))
    }

    async fn prune_dlq(
        &self,
        before: Option<DateTime<Utc>>,
        max_entries: Option<usize>,
    ) -> Result<usize, StoreError> {
        let mut dlq = self.dlq.write();
        let initial = dlq.len();

        if let Some(before) = before {
            dlq.retain(|_, entry| entry.last_failed_at >= before);
        }

        if let Some(max) = max_entries {
            if dlq.len() > max {
                // Keep the newest `max` entries.
                let mut by_age: Vec<(Uuid, DateTime<Utc>)> = dlq
                    .values()
                    .map(|e| (e.id, e.last_failed_at))
                    .collect();
                by_age.sort_by(|a, b| a.1.cmp(&b.1));
                let excess = dlq.len() - max;
                for (id, _) in by_age.into_iter().take(excess) {
                    dlq.remove(&id);
                }
            }
        }

        Ok(initial - dlq.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::ErrorClass;
    use crate::schedule::Schedule;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn job(name: &str, priority: u8, next: &str) -> Job {
        let mut job = Job::builder(name, "h").priority(priority).build().unwrap();
        job.next_run_at = Some(utc(next));
        job
    }

    #[tokio::test]
    async fn register_is_conflict_on_duplicate() {
        let store = MemoryStore::new();
        store.register_job(job("a", 5, "2025-01-01T00:00:00Z")).await.unwrap();
        assert!(matches!(
            store.register_job(job("a", 5, "2025-01-01T00:00:00Z")).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn due_jobs_ordered_by_next_run_then_priority() {
        let store = MemoryStore::new();
        store.register_job(job("late", 0, "2025-01-01T00:02:00Z")).await.unwrap();
        store.register_job(job("low", 9, "2025-01-01T00:01:00Z")).await.unwrap();
        store.register_job(job("high", 1, "2025-01-01T00:01:00Z")).await.unwrap();
        store.register_job(job("future", 0, "2025-01-02T00:00:00Z")).await.unwrap();

        let due = store
            .get_due_jobs(utc("2025-01-01T00:05:00Z"), None, 10)
            .await
            .unwrap();
        let names: Vec<&str> = due.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low", "late"]);
    }

    #[tokio::test]
    async fn due_jobs_excludes_paused_disabled_failed() {
        let store = MemoryStore::new();
        store.register_job(job("ok", 5, "2025-01-01T00:00:00Z")).await.unwrap();
        store.register_job(job("paused", 5, "2025-01-01T00:00:00Z")).await.unwrap();
        store.register_job(job("off", 5, "2025-01-01T00:00:00Z")).await.unwrap();

        store
            .update_job("paused", JobChanges::default().paused(true))
            .await
            .unwrap();
        store
            .update_job("off", JobChanges::default().enabled(false))
            .await
            .unwrap();

        let due = store.get_due_jobs(utc("2025-01-01T01:00:00Z"), None, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "ok");
    }

    #[tokio::test]
    async fn lock_mutual_exclusion_and_expiry() {
        let clock = Arc::new(ManualClock::new(utc("2025-01-01T00:00:00Z")));
        let store = MemoryStore::with_clock(clock.clone());
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.acquire_unique_lock("k", "node-a", ttl).await.unwrap(),
            LockAcquire::Acquired
        );
        assert_eq!(
            store.acquire_unique_lock("k", "node-b", ttl).await.unwrap(),
            LockAcquire::Locked
        );

        // Same owner renews.
        assert_eq!(
            store.acquire_unique_lock("k", "node-a", ttl).await.unwrap(),
            LockAcquire::Acquired
        );

        // Past expiry anyone may take it over.
        clock.advance(Duration::from_secs(61));
        assert_eq!(
            store.acquire_unique_lock("k", "node-b", ttl).await.unwrap(),
            LockAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn release_is_noop_for_non_holder() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.acquire_unique_lock("k", "node-a", ttl).await.unwrap();

        store.release_unique_lock("k", "node-b").await.unwrap();
        assert_eq!(
            store.acquire_unique_lock("k", "node-c", ttl).await.unwrap(),
            LockAcquire::Locked
        );

        store.release_unique_lock("k", "node-a").await.unwrap();
        assert_eq!(
            store.acquire_unique_lock("k", "node-c", ttl).await.unwrap(),
            LockAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let store = MemoryStore::new();
        assert!(store
            .acquire_unique_lock("k", "a", Duration::ZERO)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn execution_finalized_exactly_once() {
        let store = MemoryStore::new();
        let exec = Execution::begin("a", 1, "node", Utc::now());
        let id = exec.id;
        store.record_execution_start(exec.clone()).await.unwrap();

        let mut done = exec.clone();
        done.state = ExecutionState::Succeeded;
        done.completed_at = Some(Utc::now());
        store.record_execution_complete(done.clone()).await.unwrap();

        // A second finalization is a conflict.
        let mut again = done;
        again.state = ExecutionState::Failed;
        assert!(matches!(
            store.record_execution_complete(again).await,
            Err(StoreError::Conflict(_))
        ));

        let listed = store.list_executions("a", Pagination::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].state, ExecutionState::Succeeded);
    }

    #[tokio::test]
    async fn mark_completed_updates_counters() {
        let store = MemoryStore::new();
        let mut j = Job::builder("s", "h")
            .schedule(Schedule::interval(Duration::from_secs(60)).unwrap())
            .build()
            .unwrap();
        j.next_run_at = Some(utc("2025-01-01T00:00:00Z"));
        store.register_job(j).await.unwrap();

        store
            .mark_completed("s", Some(serde_json::json!({"rows": 10})), None)
            .await
            .unwrap();
        let job = store.get_job("s").await.unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.last_result, Some(serde_json::json!({"rows": 10})));
        // Untouched when the finalizer passes None.
        assert_eq!(job.next_run_at, Some(utc("2025-01-01T00:00:00Z")));
    }

    fn dlq_entry(name: &str, at: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            id: Uuid::now_v7(),
            job_name: name.to_string(),
            queue: "default".to_string(),
            error: ErrorInfo::new(ErrorClass::Retryable, "boom"),
            attempts: 3,
            first_failed_at: utc(at),
            last_failed_at: utc(at),
            args: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn prune_by_age_and_count_keeps_newest() {
        let store = MemoryStore::new();
        store.insert_dlq(dlq_entry("old", "2025-01-01T00:00:00Z")).await.unwrap();
        store.insert_dlq(dlq_entry("mid", "2025-02-01T00:00:00Z")).await.unwrap();
        store.insert_dlq(dlq_entry("new", "2025-03-01T00:00:00Z")).await.unwrap();

        // Age bound removes only `old`.
        let removed = store
            .prune_dlq(Some(utc("2025-01-15T00:00:00Z")), None)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        // Count bound keeps the most recent entry.
        let removed = store.prune_dlq(None, Some(1)).await.unwrap();
        assert_eq!(removed, 1);
        let left = store.list_dlq(DlqFilter::default(), Pagination::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].job_name, "new");
    }
}
