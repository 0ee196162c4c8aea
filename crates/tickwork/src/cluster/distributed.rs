//! Store-backed coordinator
//!
//! Locks and leadership live in the shared store, so any number of nodes
//! may cooperate. Leadership is itself a lock on a reserved key, renewed on
//! every check; the node holding it runs the scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::persistence::Store;

use super::{Coordinator, CoordinatorError, LockAcquire};

/// Reserved lock key that carries leadership.
const LEADER_KEY: &str = "__leader__";

/// Coordinator that stores locks in the shared [`Store`] backend.
///
/// Acquisition is a conditional insert ("insert iff no row exists or the
/// existing row expired"), so correctness only requires the store to
/// linearize that operation.
pub struct StoreBackedCoordinator {
    store: Arc<dyn Store>,
    node_id: String,
    leader_ttl: Duration,
    /// Keys this node believes it holds, released in bulk at shutdown.
    held: DashMap<String, ()>,
}

impl StoreBackedCoordinator {
    pub fn new(store: Arc<dyn Store>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            leader_ttl: Duration::from_secs(15),
            held: DashMap::new(),
        }
    }

    /// TTL on the leadership lock. Leadership lapses this long after the
    /// leader stops checking in.
    pub fn with_leader_ttl(mut self, ttl: Duration) -> Self {
        self.leader_ttl = ttl;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Coordinator for StoreBackedCoordinator {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, CoordinatorError> {
        if ttl.is_zero() {
            return Err(CoordinatorError::InvalidTtl);
        }
        let acquired = self.store.acquire_unique_lock(key, owner, ttl).await?;
        if acquired == LockAcquire::Acquired {
            self.held.insert(key.to_string(), ());
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), CoordinatorError> {
        self.held.remove(key);
        self.store.release_unique_lock(key, owner).await?;
        Ok(())
    }

    async fn is_leader(&self) -> bool {
        // Acquiring renews when we already lead, so the leader keeps the
        // key alive just by polling.
        match self
            .store
            .acquire_unique_lock(LEADER_KEY, &self.node_id, self.leader_ttl)
            .await
        {
            Ok(LockAcquire::Acquired) => true,
            Ok(LockAcquire::Locked) => false,
            Err(e) => {
                warn!(node_id = %self.node_id, "leadership check failed: {e}");
                false
            }
        }
    }

    async fn release_owned(&self, owner: &str) -> Result<(), CoordinatorError> {
        let keys: Vec<String> = self.held.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Err(e) = self.store.release_unique_lock(&key, owner).await {
                warn!(key, "failed to release lock at shutdown: {e}");
            }
            self.held.remove(&key);
        }
        self.store.release_unique_lock(LEADER_KEY, owner).await?;
        Ok(())
    }
}
