//! Per-queue state: priority wait list and worker accounting
//!
//! The wait list is a binary heap ordered by (priority, enqueue sequence),
//! so mutations stay O(log n) under burst push. The queue loop is the only
//! consumer; pushes, cancels, and control operations may come from
//! anywhere.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::run::JobRun;

/// Wait-list entry; lower priority value and earlier sequence run first.
#[derive(Debug)]
pub(crate) struct QueuedRun {
    pub priority: u8,
    pub seq: u64,
    pub run: JobRun,
}

impl PartialEq for QueuedRun {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRun {}

impl PartialOrd for QueuedRun {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRun {
    // BinaryHeap is a max-heap; invert so the "greatest" entry is the one
    // that should run first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub running: usize,
    pub pending: usize,
    pub paused: bool,
    pub concurrency: usize,
}

/// Shared state of one named queue.
pub(crate) struct QueueState {
    pub name: String,
    paused: AtomicBool,
    /// Worker cap; reducing it lets excess workers finish then exit.
    target: AtomicUsize,
    running: AtomicUsize,
    max_pending: Option<usize>,
    seq: AtomicU64,
    waiting: Mutex<BinaryHeap<QueuedRun>>,
    /// Wakes the queue loop on push, resume, scale-up, and worker exit.
    pub notify: Notify,
}

impl QueueState {
    pub fn new(name: impl Into<String>, concurrency: usize, max_pending: Option<usize>) -> Self {
        Self {
            name: name.into(),
            paused: AtomicBool::new(false),
            target: AtomicUsize::new(concurrency.max(1)),
            running: AtomicUsize::new(0),
            max_pending,
            seq: AtomicU64::new(0),
            waiting: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueue a run; fails only when `max_pending` is configured and hit.
    pub fn push(&self, run: JobRun) -> Result<(), JobRun> {
        let mut waiting = self.waiting.lock();
        if let Some(cap) = self.max_pending {
            if waiting.len() >= cap {
                return Err(run);
            }
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        waiting.push(QueuedRun {
            priority: run.priority,
            seq,
            run,
        });
        drop(waiting);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next run if the queue is active and has spare capacity.
    ///
    /// Only the queue loop calls this, which keeps the capacity check and
    /// the running increment race-free.
    pub fn try_pop(&self) -> Option<JobRun> {
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        if self.running.load(Ordering::Acquire) >= self.target.load(Ordering::Acquire) {
            return None;
        }
        let popped = self.waiting.lock().pop()?;
        self.running.fetch_add(1, Ordering::AcqRel);
        Some(popped.run)
    }

    /// Worker finished; frees a slot and wakes the loop.
    pub fn worker_done(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Remove a queued (not yet started) run by execution id.
    pub fn cancel_queued(&self, execution_id: Uuid) -> Option<JobRun> {
        let mut waiting = self.waiting.lock();
        let mut cancelled = None;
        waiting.retain(|entry| {
            if entry.run.execution_id == execution_id {
                cancelled = Some(entry.run.clone());
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Drain the whole wait list (shutdown).
    pub fn take_all(&self) -> Vec<JobRun> {
        self.waiting
            .lock()
            .drain()
            .map(|entry| entry.run)
            .collect()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn scale(&self, concurrency: usize) {
        self.target.store(concurrency.max(1), Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            running: self.running(),
            pending: self.waiting.lock().len(),
            paused: self.is_paused(),
            concurrency: self.target.load(Ordering::Acquire),
        }
    }
}
