//! Dead-letter archive and replay

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::dispatch::{DispatchError, Dispatcher, JobRun, RunLock};
use crate::job::{ErrorInfo, Execution};
use crate::persistence::{DeadLetterEntry, DlqFilter, Pagination, Store, StoreError};
use crate::registry::{HandlerRegistry, JobContext};
use crate::util::to_chrono;

/// Dead-letter configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DeadLetterConfig {
    /// Entries older than this are pruned.
    #[serde(default, with = "crate::util::option_duration_millis")]
    pub max_age: Option<Duration>,

    /// At most this many entries are kept; the newest survive.
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// Handler id invoked with the entry whenever one is written.
    #[serde(default)]
    pub on_dead_letter: Option<String>,
}

impl DeadLetterConfig {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_on_dead_letter(mut self, handler: impl Into<String>) -> Self {
        self.on_dead_letter = Some(handler.into());
        self
    }
}

/// Errors from dead-letter operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DlqError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Archives exhausted failures and replays them on demand.
///
/// Entries are immutable history: replaying one re-enqueues the original
/// job body but never mutates or removes the record.
pub struct DeadLetterPipeline {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    node_id: String,
    config: DeadLetterConfig,
}

impl DeadLetterPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        node_id: impl Into<String>,
        config: DeadLetterConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            registry,
            clock,
            node_id: node_id.into(),
            config,
        }
    }

    /// Archive a run that exhausted its retries.
    ///
    /// Writes the entry, enforces configured bounds, and invokes the
    /// `on_dead_letter` callback if one is installed.
    pub async fn record(
        &self,
        run: &JobRun,
        error: ErrorInfo,
        failed_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let entry = DeadLetterEntry {
            id: Uuid::now_v7(),
            job_name: run.job_name.clone(),
            queue: run.queue.clone(),
            error,
            attempts: run.attempt,
            first_failed_at: run.first_failed_at.unwrap_or(failed_at),
            last_failed_at: failed_at,
            args: run.args.clone(),
        };
        let id = entry.id;

        self.store.insert_dlq(entry.clone()).await?;
        info!(
            job = %entry.job_name,
            queue = %entry.queue,
            class = %entry.error.class,
            attempts = entry.attempts,
            "job dead-lettered"
        );

        self.enforce_bounds().await;
        self.invoke_callback(&entry).await;
        Ok(id)
    }

    /// List entries matching `filter`, newest first.
    pub async fn list(
        &self,
        filter: DlqFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.store.list_dlq(filter, page).await
    }

    pub async fn get(&self, id: Uuid) -> Result<DeadLetterEntry, StoreError> {
        self.store.get_dlq(id).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.store.delete_dlq(id).await
    }

    /// Re-enqueue the original job body of one entry.
    ///
    /// The entry itself stays in the archive as a historical record.
    /// Returns the new execution id.
    pub async fn retry(&self, id: Uuid) -> Result<Uuid, DlqError> {
        let entry = self.store.get_dlq(id).await?;
        let job = self.store.get_job(&entry.job_name).await?;

        let execution = Execution::begin(&job.name, 1, &self.node_id, self.clock.now());
        let execution_id = execution.id;
        self.store.record_execution_start(execution).await?;

        let mut run = JobRun::for_job(&job, execution_id);
        // Replay with the archived arguments, not the job's current ones.
        run.args = entry.args.clone();
        if job.unique {
            run = run.with_lock(RunLock::Acquire {
                key: job.name.clone(),
            });
        }
        self.dispatcher.push(run)?;

        info!(job = %entry.job_name, dlq_id = %id, "dead-letter entry replayed");
        Ok(execution_id)
    }

    /// Replay every entry matching `filter`. Returns the new execution
    /// ids; entries whose job has since been deleted are skipped.
    pub async fn retry_all(&self, filter: DlqFilter) -> Result<Vec<Uuid>, DlqError> {
        let entries = self
            .store
            .list_dlq(filter, Pagination {
                offset: 0,
                limit: usize::MAX,
            })
            .await?;

        let mut replayed = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.retry(entry.id).await {
                Ok(execution_id) => replayed.push(execution_id),
                Err(DlqError::Store(StoreError::NotFound(_))) => {
                    warn!(job = %entry.job_name, "skipping replay, job no longer exists");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(replayed)
    }

    /// Prune by explicit bounds; whichever bound hits first wins and the
    /// newest entries are preserved.
    pub async fn prune(
        &self,
        before: Option<DateTime<Utc>>,
        max_entries: Option<usize>,
    ) -> Result<usize, StoreError> {
        self.store.prune_dlq(before, max_entries).await
    }

    /// Apply the configured age and count bounds.
    async fn enforce_bounds(&self) {
        if self.config.max_age.is_none() && self.config.max_entries.is_none() {
            return;
        }
        let before = self
            .config
            .max_age
            .map(|age| self.clock.now() - to_chrono(age));
        if let Err(e) = self
            .store
            .prune_dlq(before, self.config.max_entries)
            .await
        {
            warn!("dead-letter prune failed: {e}");
        }
    }

    async fn invoke_callback(&self, entry: &DeadLetterEntry) {
        let Some(handler_id) = &self.config.on_dead_letter else {
            return;
        };
        let Some(handler) = self.registry.get(handler_id) else {
            warn!(handler = %handler_id, "on_dead_letter handler not registered");
            return;
        };

        let args = match serde_json::to_value(entry) {
            Ok(args) => args,
            Err(e) => {
                warn!("failed to serialize dead-letter entry for callback: {e}");
                return;
            }
        };
        let ctx = JobContext {
            job_name: entry.job_name.clone(),
            execution_id: entry.id,
            attempt: entry.attempts,
            args,
            cancellation: CancellationToken::new(),
        };
        // Callback outcomes are advisory; failures only get logged.
        let _ = handler(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::cluster::SingleNodeCoordinator;
    use crate::dispatch::DispatcherConfig;
    use crate::job::{ErrorClass, Job, PerformOutcome};
    use crate::persistence::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink;

    #[async_trait::async_trait]
    impl crate::dispatch::RunSink for NullSink {
        async fn on_outcome(&self, _run: JobRun, _outcome: crate::dispatch::RunOutcome) {}
    }

    fn fixture() -> (
        Arc<MemoryStore>,
        Arc<Dispatcher>,
        Arc<HandlerRegistry>,
        DeadLetterConfig,
    ) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(SingleNodeCoordinator::new()),
            Arc::new(SystemClock),
            "node-test",
            DispatcherConfig::default(),
        ));
        dispatcher.start();
        dispatcher.set_sink(Arc::new(NullSink));
        (store, dispatcher, registry, DeadLetterConfig::default())
    }

    fn pipeline(
        store: &Arc<MemoryStore>,
        dispatcher: &Arc<Dispatcher>,
        registry: &Arc<HandlerRegistry>,
        config: DeadLetterConfig,
    ) -> DeadLetterPipeline {
        DeadLetterPipeline::new(
            Arc::clone(store) as Arc<dyn Store>,
            Arc::clone(dispatcher),
            Arc::clone(registry),
            Arc::new(SystemClock),
            "node-test",
            config,
        )
    }

    fn failed_run(job: &Job, attempts: u32) -> JobRun {
        let mut run = JobRun::for_job(job, Uuid::now_v7());
        run.attempt = attempts;
        run
    }

    #[tokio::test]
    async fn record_writes_entry_with_attempts() {
        let (store, dispatcher, registry, config) = fixture();
        let dlq = pipeline(&store, &dispatcher, &registry, config);
        let job = Job::builder("bad", "h").build().unwrap();

        let id = dlq
            .record(
                &failed_run(&job, 3),
                ErrorInfo::retryable("boom"),
                Utc::now(),
            )
            .await
            .unwrap();

        let entry = dlq.get(id).await.unwrap();
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.error.class, ErrorClass::Retryable);
        assert_eq!(entry.job_name, "bad");
    }

    #[tokio::test]
    async fn record_invokes_callback() {
        let (store, dispatcher, registry, _) = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = Arc::clone(&calls);
        registry.register("alerts.page", move |ctx| {
            let calls = Arc::clone(&calls_cb);
            async move {
                assert_eq!(ctx.args["job_name"], "bad");
                calls.fetch_add(1, Ordering::SeqCst);
                PerformOutcome::Ok
            }
        });

        let config = DeadLetterConfig::default().with_on_dead_letter("alerts.page");
        let dlq = pipeline(&store, &dispatcher, &registry, config);
        let job = Job::builder("bad", "h").build().unwrap();
        dlq.record(&failed_run(&job, 2), ErrorInfo::retryable("x"), Utc::now())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_enforces_max_entries() {
        let (store, dispatcher, registry, _) = fixture();
        let config = DeadLetterConfig::default().with_max_entries(2);
        let dlq = pipeline(&store, &dispatcher, &registry, config);
        let job = Job::builder("bad", "h").build().unwrap();

        for _ in 0..4 {
            dlq.record(&failed_run(&job, 1), ErrorInfo::retryable("x"), Utc::now())
                .await
                .unwrap();
        }
        assert_eq!(store.dlq_count(), 2);
    }

    #[tokio::test]
    async fn retry_reenqueues_original_args_and_keeps_entry() {
        let (store, dispatcher, registry, config) = fixture();
        let seen_args = Arc::new(parking_lot::Mutex::new(None));
        let seen = Arc::clone(&seen_args);
        registry.register("h", move |ctx| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock() = Some(ctx.args.clone());
                PerformOutcome::Ok
            }
        });

        let dlq = pipeline(&store, &dispatcher, &registry, config);
        let job = Job::builder("bad", "h")
            .args(serde_json::json!({"v": 2}))
            .build()
            .unwrap();
        store.register_job(job.clone()).await.unwrap();

        // Archive with the *original* args, then mutate the job's args.
        let mut run = failed_run(&job, 3);
        run.args = serde_json::json!({"v": 1});
        let id = dlq
            .record(&run, ErrorInfo::retryable("x"), Utc::now())
            .await
            .unwrap();

        dlq.retry(id).await.unwrap();
        while seen_args.lock().is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(*seen_args.lock(), Some(serde_json::json!({"v": 1})));

        // The archive keeps the record after a successful replay.
        assert!(dlq.get(id).await.is_ok());
    }

    #[tokio::test]
    async fn retry_all_filters_and_skips_deleted_jobs() {
        let (store, dispatcher, registry, config) = fixture();
        registry.register("h", |_| async { PerformOutcome::Ok });
        let dlq = pipeline(&store, &dispatcher, &registry, config);

        let kept = Job::builder("kept", "h").build().unwrap();
        store.register_job(kept.clone()).await.unwrap();
        let gone = Job::builder("gone", "h").build().unwrap();

        dlq.record(&failed_run(&kept, 1), ErrorInfo::retryable("x"), Utc::now())
            .await
            .unwrap();
        dlq.record(&failed_run(&gone, 1), ErrorInfo::retryable("x"), Utc::now())
            .await
            .unwrap();

        let replayed = dlq.retry_all(DlqFilter::default()).await.unwrap();
        assert_eq!(replayed.len(), 1);
    }
}
