//! Cluster coordination
//!
//! Leader election and unique-key locking. The scheduler only polls on the
//! leader; every node runs the dispatcher. Failover safety comes from lock
//! TTLs: a crashed node's locks expire and another node may re-dispatch.

mod distributed;
mod single;

use std::time::Duration;

use async_trait::async_trait;

pub use crate::persistence::LockAcquire;
use crate::persistence::StoreError;

pub use distributed::StoreBackedCoordinator;
pub use single::SingleNodeCoordinator;

/// Errors from coordinator operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    /// TTLs must be positive; a zero TTL would make a lock that is already
    /// expired.
    #[error("lock ttl must be positive")]
    InvalidTtl,

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Mutual exclusion and leadership for one or many cooperating nodes.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Try to take the lock for `key`. At most one owner holds a
    /// non-expired lock per key; re-acquiring a key you already own renews
    /// it.
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, CoordinatorError>;

    /// Release `key` if `owner` holds it; no-op otherwise.
    async fn release(&self, key: &str, owner: &str) -> Result<(), CoordinatorError>;

    /// Whether this node currently leads (and so may run the scheduler).
    async fn is_leader(&self) -> bool;

    /// Release every lock this node acquired; called on shutdown.
    async fn release_owned(&self, owner: &str) -> Result<(), CoordinatorError>;
}
