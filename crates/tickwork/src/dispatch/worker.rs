//! Worker execution of a single run
//!
//! Enforces the per-attempt timeout, observes the cooperative cancellation
//! signal, resolves the handler through the registry, and maps the body's
//! outcome to a [`RunVerdict`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::cluster::{Coordinator, LockAcquire};
use crate::job::{ErrorInfo, PerformOutcome};
use crate::registry::{HandlerRegistry, JobContext};

use super::run::{JobRun, RunLock, RunOutcome, RunVerdict};

/// Cancellation handle for an in-flight run.
pub(crate) struct CancelEntry {
    pub token: CancellationToken,
    pub reason: Arc<Mutex<Option<String>>>,
}

/// Execute one run to a verdict.
///
/// Returns `None` when the dispatch was abandoned because a unique lock
/// was already taken; the job is reconsidered at its next poll.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute(
    run: &JobRun,
    registry: &HandlerRegistry,
    coordinator: &dyn Coordinator,
    clock: &dyn Clock,
    lock_margin: Duration,
    cancellations: &DashMap<Uuid, CancelEntry>,
) -> Option<RunOutcome> {
    // Unique runs pushed outside the scheduler acquire their lock here.
    // The attempt owns the lock, so a concurrent attempt anywhere in the
    // cluster (this node included) is turned away.
    if let RunLock::Acquire { key } = &run.lock {
        let ttl = run.timeout + lock_margin;
        let owner = run.execution_id.to_string();
        match coordinator.try_acquire(key, &owner, ttl).await {
            Ok(LockAcquire::Acquired) => {}
            Ok(LockAcquire::Locked) => {
                debug!(job = %run.job_name, key, "unique lock taken, abandoning dispatch");
                return None;
            }
            Err(e) => {
                let started_at = clock.now();
                return Some(RunOutcome {
                    started_at,
                    completed_at: started_at,
                    verdict: RunVerdict::Failure(ErrorInfo::retryable(format!(
                        "unique lock acquisition failed: {e}"
                    ))),
                });
            }
        }
    }

    let started_at = clock.now();
    let token = CancellationToken::new();
    let reason = Arc::new(Mutex::new(None));
    cancellations.insert(
        run.execution_id,
        CancelEntry {
            token: token.clone(),
            reason: Arc::clone(&reason),
        },
    );

    let verdict = match registry.get(&run.handler) {
        None => RunVerdict::Failure(ErrorInfo::permanent(format!(
            "unknown handler {:?}",
            run.handler
        ))),
        Some(handler) => {
            let ctx = JobContext {
                job_name: run.job_name.clone(),
                execution_id: run.execution_id,
                attempt: run.attempt,
                args: run.args.clone(),
                cancellation: token.clone(),
            };
            let body = handler(ctx);

            tokio::select! {
                outcome = tokio::time::timeout(run.timeout, body) => match outcome {
                    Ok(perform) => verdict_for(perform),
                    Err(_) => {
                        // Budget exceeded; raise the cooperative signal so
                        // the (dropped) body's children stop too.
                        token.cancel();
                        RunVerdict::TimedOut
                    }
                },
                _ = token.cancelled() => {
                    let reason = reason
                        .lock()
                        .take()
                        .unwrap_or_else(|| "cancelled".to_string());
                    RunVerdict::Cancelled { reason }
                }
            }
        }
    };

    cancellations.remove(&run.execution_id);
    Some(RunOutcome {
        started_at,
        completed_at: clock.now(),
        verdict,
    })
}

/// Map the body's tagged return to a verdict.
fn verdict_for(outcome: PerformOutcome) -> RunVerdict {
    match outcome {
        PerformOutcome::Ok => RunVerdict::Success(None),
        PerformOutcome::OkWith(value) => RunVerdict::Success(Some(value)),
        PerformOutcome::Error(message) => {
            RunVerdict::Failure(ErrorInfo::new(crate::dlq::classify(&message), message))
        }
        PerformOutcome::Retry(delay) => RunVerdict::RetryRequested { delay },
        PerformOutcome::Cancel(reason) => RunVerdict::Cancelled { reason },
        PerformOutcome::Discard(reason) => RunVerdict::Discarded { reason },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::cluster::SingleNodeCoordinator;
    use crate::job::{ErrorClass, Job};
    use crate::registry::HandlerRegistry;

    fn fixture() -> (
        HandlerRegistry,
        SingleNodeCoordinator,
        SystemClock,
        DashMap<Uuid, CancelEntry>,
    ) {
        (
            HandlerRegistry::new(),
            SingleNodeCoordinator::new(),
            SystemClock,
            DashMap::new(),
        )
    }

    fn run_for(job: &Job) -> JobRun {
        JobRun::for_job(job, Uuid::now_v7())
    }

    #[tokio::test]
    async fn success_with_result() {
        let (registry, coord, clock, cancels) = fixture();
        registry.register("ok", |_| async {
            PerformOutcome::OkWith(serde_json::json!({"n": 1}))
        });
        let job = Job::builder("a", "ok").build().unwrap();

        let outcome = execute(
            &run_for(&job),
            &registry,
            &coord,
            &clock,
            Duration::from_secs(30),
            &cancels,
        )
        .await
        .unwrap();

        assert_eq!(
            outcome.verdict,
            RunVerdict::Success(Some(serde_json::json!({"n": 1})))
        );
        assert!(cancels.is_empty());
    }

    #[tokio::test]
    async fn unknown_handler_is_permanent() {
        let (registry, coord, clock, cancels) = fixture();
        let job = Job::builder("a", "ghost").build().unwrap();

        let outcome = execute(
            &run_for(&job),
            &registry,
            &coord,
            &clock,
            Duration::from_secs(30),
            &cancels,
        )
        .await
        .unwrap();

        match outcome.verdict {
            RunVerdict::Failure(err) => assert_eq!(err.class, ErrorClass::Permanent),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_marks_timed_out() {
        let (registry, coord, clock, cancels) = fixture();
        registry.register("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            PerformOutcome::Ok
        });
        let job = Job::builder("a", "slow")
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();

        let outcome = execute(
            &run_for(&job),
            &registry,
            &coord,
            &clock,
            Duration::from_secs(30),
            &cancels,
        )
        .await
        .unwrap();

        assert_eq!(outcome.verdict, RunVerdict::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_signal_wins() {
        let (registry, coord, clock, cancels) = fixture();
        registry.register("wait", |ctx| async move {
            ctx.cancellation.cancelled().await;
            PerformOutcome::Ok
        });
        let job = Job::builder("a", "wait").build().unwrap();
        let run = run_for(&job);
        let exec_id = run.execution_id;

        let cancels = Arc::new(cancels);
        let cancels2 = Arc::clone(&cancels);
        let handle = tokio::spawn(async move {
            // Wait for the worker to register its token, then cancel it.
            loop {
                if let Some(entry) = cancels2.get(&exec_id) {
                    *entry.reason.lock() = Some("operator asked".to_string());
                    entry.token.cancel();
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let outcome = execute(
            &run,
            &registry,
            &coord,
            &clock,
            Duration::from_secs(30),
            cancels.as_ref(),
        )
        .await
        .unwrap();
        handle.await.unwrap();

        assert_eq!(
            outcome.verdict,
            RunVerdict::Cancelled {
                reason: "operator asked".to_string()
            }
        );
    }

    #[tokio::test]
    async fn acquire_lock_abandons_when_taken() {
        let (registry, coord, clock, cancels) = fixture();
        registry.register("ok", |_| async { PerformOutcome::Ok });
        coord
            .try_acquire("sync", "other-node", Duration::from_secs(60))
            .await
            .unwrap();

        let job = Job::builder("sync", "ok").build().unwrap();
        let run = run_for(&job).with_lock(RunLock::Acquire { key: "sync".into() });

        let outcome = execute(
            &run,
            &registry,
            &coord,
            &clock,
            Duration::from_secs(30),
            &cancels,
        )
        .await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn body_retry_and_discard_map_through() {
        let (registry, coord, clock, cancels) = fixture();
        registry.register("retry", |_| async {
            PerformOutcome::Retry(Duration::from_secs(9))
        });
        registry.register("discard", |_| async {
            PerformOutcome::Discard("stale payload".to_string())
        });

        let job = Job::builder("a", "retry").build().unwrap();
        let outcome = execute(
            &run_for(&job),
            &registry,
            &coord,
            &clock,
            Duration::from_secs(30),
            &cancels,
        )
        .await
        .unwrap();
        assert_eq!(
            outcome.verdict,
            RunVerdict::RetryRequested {
                delay: Duration::from_secs(9)
            }
        );

        let job = Job::builder("a", "discard").build().unwrap();
        let outcome = execute(
            &run_for(&job),
            &registry,
            &coord,
            &clock,
            Duration::from_secs(30),
            &cancels,
        )
        .await
        .unwrap();
        assert_eq!(
            outcome.verdict,
            RunVerdict::Discarded {
                reason: "stale payload".to_string()
            }
        );
    }
}
