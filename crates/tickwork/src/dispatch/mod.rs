//! Queue dispatcher
//!
//! Maintains one bounded worker pool per named queue with priority
//! ordering, pause/resume, live rescaling, unique-job locking, per-attempt
//! timeouts, and cooperative cancellation. Fairness across queues is not
//! guaranteed; each queue is independent.

mod queue;
mod run;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::cluster::Coordinator;
use crate::registry::HandlerRegistry;

pub use queue::QueueStats;
pub use run::{JobRun, RunKind, RunLock, RunOutcome, RunSink, RunVerdict};

use queue::QueueState;
use worker::CancelEntry;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Named queues and their concurrency caps, created at start.
    pub queues: HashMap<String, usize>,

    /// Cap for queues created on first push.
    pub default_concurrency: usize,

    /// Optional bound on waiting runs per queue; `push` fails with
    /// `queue_full` beyond it.
    pub max_pending: Option<usize>,

    /// Added to the run timeout when sizing unique-lock TTLs.
    pub lock_safety_margin: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            default_concurrency: 10,
            max_pending: None,
            lock_safety_margin: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_queue(mut self, name: impl Into<String>, concurrency: usize) -> Self {
        self.queues.insert(name.into(), concurrency);
        self
    }

    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = Some(max_pending);
        self
    }
}

/// Dispatcher errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The queue's `max_pending` bound was hit; the scheduler leaves
    /// `next_run_at` unchanged so the work is reconsidered next tick.
    #[error("queue {0:?} is full")]
    QueueFull(String),

    /// Control operation against a queue that does not exist.
    #[error("unknown queue {0:?}")]
    UnknownQueue(String),

    /// New pushes are refused during shutdown.
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// Shared state behind the [`Dispatcher`] handle; spawned queue loops and
/// workers hold clones of this.
struct Inner {
    config: DispatcherConfig,
    registry: Arc<HandlerRegistry>,
    coordinator: Arc<dyn Coordinator>,
    clock: Arc<dyn Clock>,
    node_id: String,
    queues: DashMap<String, Arc<QueueState>>,
    cancellations: DashMap<Uuid, CancelEntry>,
    sink: RwLock<Option<Arc<dyn RunSink>>>,
    accepting: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    async fn deliver(&self, run: JobRun, outcome: RunOutcome) {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => sink.on_outcome(run, outcome).await,
            None => warn!(job = %run.job_name, "run finished with no sink installed"),
        }
    }

    fn total_running(&self) -> usize {
        self.queues.iter().map(|q| q.running()).sum()
    }
}

/// One queue loop per queue: pops as long as capacity allows, then waits
/// for a push, a freed worker, or a control wakeup.
fn spawn_queue_loop(inner: Arc<Inner>, queue: Arc<QueueState>) {
    tokio::spawn(async move {
        loop {
            while let Some(run) = queue.try_pop() {
                spawn_worker(Arc::clone(&inner), Arc::clone(&queue), run);
            }
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = inner.shutdown.cancelled() => break,
            }
        }
        debug!(queue = %queue.name, "queue loop exited");
    });
}

fn spawn_worker(inner: Arc<Inner>, queue: Arc<QueueState>, run: JobRun) {
    tokio::spawn(async move {
        let outcome = worker::execute(
            &run,
            &inner.registry,
            inner.coordinator.as_ref(),
            inner.clock.as_ref(),
            inner.config.lock_safety_margin,
            &inner.cancellations,
        )
        .await;

        queue.worker_done();

        if let Some(outcome) = outcome {
            inner.deliver(run, outcome).await;
        }
    });
}

/// Per-queue worker pools behind one facade.
///
/// Completions are delivered to the installed [`RunSink`]; the supervisor
/// wires one in before any work is pushed. The handle is cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        coordinator: Arc<dyn Coordinator>,
        clock: Arc<dyn Clock>,
        node_id: impl Into<String>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                coordinator,
                clock,
                node_id: node_id.into(),
                queues: DashMap::new(),
                cancellations: DashMap::new(),
                sink: RwLock::new(None),
                accepting: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Install the completion sink. Must happen before the first push.
    pub fn set_sink(&self, sink: Arc<dyn RunSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    /// Spawn queue loops for every configured queue.
    pub fn start(&self) {
        let configured: Vec<(String, usize)> = self
            .inner
            .config
            .queues
            .iter()
            .map(|(name, cap)| (name.clone(), *cap))
            .collect();
        for (name, concurrency) in configured {
            self.ensure_queue(&name, concurrency);
        }
        info!(
            node_id = %self.inner.node_id,
            queues = self.inner.queues.len(),
            "dispatcher started"
        );
    }

    /// Enqueue a run onto its queue, creating the queue on first use.
    #[instrument(skip(self, run), fields(job = %run.job_name, queue = %run.queue))]
    pub fn push(&self, run: JobRun) -> Result<(), DispatchError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(DispatchError::ShuttingDown);
        }
        let queue_name = run.queue.clone();
        let queue = self.ensure_queue(&queue_name, self.inner.config.default_concurrency);
        queue
            .push(run)
            .map_err(|rejected| DispatchError::QueueFull(rejected.queue))
    }

    /// Pause a queue: running workers drain normally, nothing new starts.
    pub fn pause(&self, queue: &str) -> Result<(), DispatchError> {
        self.queue(queue)?.pause();
        Ok(())
    }

    /// Resume a paused queue.
    pub fn resume(&self, queue: &str) -> Result<(), DispatchError> {
        self.queue(queue)?.resume();
        Ok(())
    }

    /// Change a queue's concurrency cap. Shrinking lets excess workers
    /// finish their current run then exit; growing takes effect
    /// immediately.
    pub fn scale(&self, queue: &str, concurrency: usize) -> Result<(), DispatchError> {
        self.queue(queue)?.scale(concurrency);
        Ok(())
    }

    /// Stats for one queue.
    pub fn stats(&self, queue: &str) -> Result<QueueStats, DispatchError> {
        Ok(self.queue(queue)?.stats())
    }

    /// Stats for every queue.
    pub fn all_stats(&self) -> HashMap<String, QueueStats> {
        self.inner
            .queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Raise the cancellation signal for an execution.
    ///
    /// In-flight attempts are finalized as `cancelled` with `reason`;
    /// queued (not yet started) runs are dropped and finalized the same
    /// way. Idempotent: cancelling an unknown id returns false.
    pub async fn cancel(&self, execution_id: Uuid, reason: &str) -> bool {
        if let Some(entry) = self.inner.cancellations.get(&execution_id) {
            *entry.reason.lock() = Some(reason.to_string());
            entry.token.cancel();
            return true;
        }

        // Not running; maybe still waiting in a queue. Finish the map
        // walk before delivering so the sink can push freely.
        let mut dropped = None;
        for queue in self.inner.queues.iter() {
            if let Some(run) = queue.cancel_queued(execution_id) {
                dropped = Some(run);
                break;
            }
        }
        if let Some(run) = dropped {
            let now = self.inner.clock.now();
            self.inner
                .deliver(
                    run,
                    RunOutcome {
                        started_at: now,
                        completed_at: now,
                        verdict: RunVerdict::Cancelled {
                            reason: reason.to_string(),
                        },
                    },
                )
                .await;
            return true;
        }
        false
    }

    /// Workers currently executing across all queues.
    pub fn total_running(&self) -> usize {
        self.inner.total_running()
    }

    /// Graceful shutdown: refuse new pushes, stop dispatching, give
    /// in-flight workers `grace` to finish, cancel the rest, then finalize
    /// whatever never started as cancelled.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.accepting.store(false, Ordering::Release);
        for queue in self.inner.queues.iter() {
            queue.pause();
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.inner.total_running() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stragglers = self.inner.total_running();
        if stragglers > 0 {
            warn!(stragglers, "grace period elapsed, cancelling remaining workers");
            for entry in self.inner.cancellations.iter() {
                *entry.reason.lock() = Some("shutdown".to_string());
                entry.token.cancel();
            }
            // Cancelled workers still report through the sink; give them a
            // moment to finalize.
            let cancel_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while self.inner.total_running() > 0
                && tokio::time::Instant::now() < cancel_deadline
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        // Never-started work is finalized as cancelled.
        let queues: Vec<Arc<QueueState>> = self
            .inner
            .queues
            .iter()
            .map(|q| Arc::clone(q.value()))
            .collect();
        for queue in queues {
            for run in queue.take_all() {
                let now = self.inner.clock.now();
                self.inner
                    .deliver(
                        run,
                        RunOutcome {
                            started_at: now,
                            completed_at: now,
                            verdict: RunVerdict::Cancelled {
                                reason: "shutdown".to_string(),
                            },
                        },
                    )
                    .await;
            }
        }

        self.inner.shutdown.cancel();
        info!("dispatcher stopped");
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueState>, DispatchError> {
        self.inner
            .queues
            .get(name)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| DispatchError::UnknownQueue(name.to_string()))
    }

    /// Get or create a queue and its loop. Exactly one loop consumes each
    /// queue, so creation goes through the entry API.
    fn ensure_queue(&self, name: &str, concurrency: usize) -> Arc<QueueState> {
        match self.inner.queues.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Arc::clone(entry.get()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let queue = Arc::new(QueueState::new(
                    name,
                    concurrency,
                    self.inner.config.max_pending,
                ));
                entry.insert(Arc::clone(&queue));
                spawn_queue_loop(Arc::clone(&self.inner), Arc::clone(&queue));
                debug!(queue = name, concurrency, "queue created");
                queue
            }
        }
    }

    #[cfg(test)]
    fn has_inflight(&self, execution_id: &Uuid) -> bool {
        self.inner.cancellations.contains_key(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::cluster::SingleNodeCoordinator;
    use crate::job::{Job, PerformOutcome};
    use parking_lot::Mutex;

    /// Sink that remembers every outcome.
    struct RecordingSink {
        outcomes: Mutex<Vec<(JobRun, RunOutcome)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(vec![]),
            })
        }

        fn count(&self) -> usize {
            self.outcomes.lock().len()
        }

        async fn wait_for(&self, count: usize) {
            while self.count() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    }

    #[async_trait::async_trait]
    impl RunSink for RecordingSink {
        async fn on_outcome(&self, run: JobRun, outcome: RunOutcome) {
            self.outcomes.lock().push((run, outcome));
        }
    }

    fn dispatcher() -> (Arc<Dispatcher>, Arc<HandlerRegistry>, Arc<RecordingSink>) {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(SingleNodeCoordinator::new()),
            Arc::new(SystemClock),
            "node-test",
            DispatcherConfig::default().with_queue("default", 2),
        ));
        dispatcher.start();
        let sink = RecordingSink::new();
        dispatcher.set_sink(sink.clone());
        (dispatcher, registry, sink)
    }

    fn run_for(job: &Job) -> JobRun {
        JobRun::for_job(job, Uuid::now_v7())
    }

    #[tokio::test]
    async fn push_executes_and_reports() {
        let (dispatcher, registry, sink) = dispatcher();
        registry.register("ok", |_| async { PerformOutcome::Ok });
        let job = Job::builder("a", "ok").build().unwrap();

        dispatcher.push(run_for(&job)).unwrap();
        sink.wait_for(1).await;

        let outcomes = sink.outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1.verdict, RunVerdict::Success(None));
    }

    #[tokio::test]
    async fn paused_queue_holds_work_until_resume() {
        let (dispatcher, registry, sink) = dispatcher();
        registry.register("ok", |_| async { PerformOutcome::Ok });
        let job = Job::builder("a", "ok").build().unwrap();

        dispatcher.pause("default").unwrap();
        dispatcher.push(run_for(&job)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(sink.count(), 0);
        assert_eq!(dispatcher.stats("default").unwrap().pending, 1);

        dispatcher.resume("default").unwrap();
        sink.wait_for(1).await;
    }

    #[tokio::test]
    async fn unknown_queue_control_errors() {
        let (dispatcher, _, _) = dispatcher();
        assert!(matches!(
            dispatcher.pause("ghost"),
            Err(DispatchError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn priority_orders_waiting_work() {
        let (dispatcher, registry, sink) = dispatcher();

        // One slot, blocked until released, so pushes stack up behind it.
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let gate_body = Arc::clone(&gate);
        registry.register("gated", move |_| {
            let gate = Arc::clone(&gate_body);
            async move {
                let _ = gate.acquire().await;
                PerformOutcome::Ok
            }
        });
        dispatcher.scale("default", 1).unwrap();

        let blocker = Job::builder("blocker", "gated").priority(0).build().unwrap();
        let low = Job::builder("low", "gated").priority(9).build().unwrap();
        let high = Job::builder("high", "gated").priority(1).build().unwrap();

        dispatcher.push(run_for(&blocker)).unwrap();
        tokio::task::yield_now().await;
        dispatcher.push(run_for(&low)).unwrap();
        dispatcher.push(run_for(&high)).unwrap();

        gate.add_permits(3);
        sink.wait_for(3).await;

        let order: Vec<String> = sink
            .outcomes
            .lock()
            .iter()
            .map(|(run, _)| run.job_name.clone())
            .collect();
        assert_eq!(order, vec!["blocker", "high", "low"]);
    }

    #[tokio::test]
    async fn cancel_running_execution() {
        let (dispatcher, registry, sink) = dispatcher();
        registry.register("wait", |ctx| async move {
            ctx.cancellation.cancelled().await;
            PerformOutcome::Ok
        });
        let job = Job::builder("a", "wait").build().unwrap();
        let run = run_for(&job);
        let exec_id = run.execution_id;

        dispatcher.push(run).unwrap();
        // Let the worker start and register its token.
        while !dispatcher.has_inflight(&exec_id) {
            tokio::task::yield_now().await;
        }

        assert!(dispatcher.cancel(exec_id, "operator").await);
        sink.wait_for(1).await;

        let outcomes = sink.outcomes.lock();
        assert_eq!(
            outcomes[0].1.verdict,
            RunVerdict::Cancelled {
                reason: "operator".to_string()
            }
        );
    }

    #[tokio::test]
    async fn cancel_queued_execution_without_start() {
        let (dispatcher, registry, sink) = dispatcher();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let gate_body = Arc::clone(&gate);
        registry.register("gated", move |_| {
            let gate = Arc::clone(&gate_body);
            async move {
                let _ = gate.acquire().await;
                PerformOutcome::Ok
            }
        });
        dispatcher.scale("default", 1).unwrap();

        let blocker = Job::builder("blocker", "gated").build().unwrap();
        let queued = Job::builder("queued", "gated").build().unwrap();
        let queued_run = run_for(&queued);
        let queued_id = queued_run.execution_id;

        dispatcher.push(run_for(&blocker)).unwrap();
        tokio::task::yield_now().await;
        dispatcher.push(queued_run).unwrap();

        assert!(dispatcher.cancel(queued_id, "not needed").await);
        gate.add_permits(1);
        sink.wait_for(2).await;

        let outcomes = sink.outcomes.lock();
        let cancelled = outcomes
            .iter()
            .find(|(run, _)| run.execution_id == queued_id)
            .unwrap();
        assert_eq!(
            cancelled.1.verdict,
            RunVerdict::Cancelled {
                reason: "not needed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn cancel_unknown_is_idempotent_false() {
        let (dispatcher, _, _) = dispatcher();
        assert!(!dispatcher.cancel(Uuid::now_v7(), "whatever").await);
    }

    #[tokio::test]
    async fn queue_full_surfaces() {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(SingleNodeCoordinator::new()),
            Arc::new(SystemClock),
            "node-test",
            DispatcherConfig::default()
                .with_queue("default", 1)
                .with_max_pending(1),
        ));
        dispatcher.start();
        dispatcher.set_sink(RecordingSink::new());
        dispatcher.pause("default").unwrap();

        let job = Job::builder("a", "missing").build().unwrap();
        dispatcher.push(run_for(&job)).unwrap();
        assert!(matches!(
            dispatcher.push(run_for(&job)),
            Err(DispatchError::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_work() {
        let (dispatcher, registry, sink) = dispatcher();
        registry.register("ok", |_| async { PerformOutcome::Ok });
        dispatcher.pause("default").unwrap();

        let job = Job::builder("a", "ok").build().unwrap();
        dispatcher.push(run_for(&job)).unwrap();

        dispatcher.shutdown(Duration::from_millis(100)).await;
        assert_eq!(sink.count(), 1);
        assert!(matches!(
            sink.outcomes.lock()[0].1.verdict,
            RunVerdict::Cancelled { .. }
        ));

        // New pushes are refused.
        assert!(matches!(
            dispatcher.push(run_for(&job)),
            Err(DispatchError::ShuttingDown)
        ));
    }
}
