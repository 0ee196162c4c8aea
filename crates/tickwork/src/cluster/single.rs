//! Single-node coordinator
//!
//! Trivially the leader; locks live in process memory. The default for
//! deployments that run one scheduler process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::util::to_chrono;

use super::{Coordinator, CoordinatorError, LockAcquire};

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// In-memory coordinator for a single process.
pub struct SingleNodeCoordinator {
    clock: Arc<dyn Clock>,
    locks: DashMap<String, LockEntry>,
}

impl SingleNodeCoordinator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            locks: DashMap::new(),
        }
    }

    /// Number of live (non-expired) locks.
    pub fn live_locks(&self) -> usize {
        let now = self.clock.now();
        self.locks.iter().filter(|e| e.expires_at > now).count()
    }
}

impl Default for SingleNodeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for SingleNodeCoordinator {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, CoordinatorError> {
        if ttl.is_zero() {
            return Err(CoordinatorError::InvalidTtl);
        }
        let now = self.clock.now();

        // The entry API holds the shard lock, making check-and-set atomic.
        let mut acquired = false;
        self.locks
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expires_at <= now || entry.owner == owner {
                    entry.owner = owner.to_string();
                    entry.expires_at = now + to_chrono(ttl);
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockEntry {
                    owner: owner.to_string(),
                    expires_at: now + to_chrono(ttl),
                }
            });

        Ok(if acquired {
            LockAcquire::Acquired
        } else {
            LockAcquire::Locked
        })
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), CoordinatorError> {
        self.locks
            .remove_if(key, |_, entry| entry.owner == owner);
        Ok(())
    }

    async fn is_leader(&self) -> bool {
        true
    }

    async fn release_owned(&self, owner: &str) -> Result<(), CoordinatorError> {
        self.locks.retain(|_, entry| entry.owner != owner);
        Ok(())
    }
}
