//! Run persistence with per-run exclusive locks.
//!
//! A worker checks a run out with [`RunStore::acquire_lock`], advances it and
//! releases the token. Stores never hand out a second token for a run whose
//! lock is held. Locks are leases: a lock not renewed within the store's TTL
//! is stale and may be taken over, so a crashed worker cannot wedge a run.
//! Holders write through [`RunStore::save_locked`], which renews the lease
//! and refuses the write once the lock has passed to someone else.
//!
//! # Implementations
//!
//! - [`MemoryRunStore`]: process-local maps, for tests and single-process use
//! - [`FileRunStore`]: one JSON document per run plus exclusive `.lock` files
//! - [`RedisRunStore`]: JSON values with `SET NX PX` locks
//!
//! # Usage
//!
//! ```rust,ignore
//! use reelforge::storage::{FileRunStore, RunStore};
//!
//! let store = FileRunStore::open("./runs").await?;
//! let token = store.acquire_lock(run_id).await?;
//! let mut run = store.load(run_id).await?;
//! // ... advance the run ...
//! store.save_locked(&run, &token).await?;
//! store.release_lock(token).await?;
//! ```

pub mod file;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::Run;

pub use file::FileRunStore;
pub use memory::MemoryRunStore;
pub use redis_store::RedisRunStore;

/// Lease length for stores that expire unreleased locks.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

/// Proof of holding a run's lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub run_id: Uuid,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

impl LockToken {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        }
    }
}

/// Persistence boundary for runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn load(&self, run_id: Uuid) -> Result<Run, StoreError>;

    /// Write a run without lock checks. Used for runs nobody holds yet.
    async fn save(&self, run: &Run) -> Result<(), StoreError>;

    /// Write a run on behalf of the lock holder and renew the lease.
    ///
    /// Fails with `StoreError::LockMismatch`, writing nothing, when `token` no
    /// longer holds the run's lock.
    async fn save_locked(&self, run: &Run, token: &LockToken) -> Result<(), StoreError>;

    /// Take the run's lock, failing with `StoreError::Locked` if held.
    async fn acquire_lock(&self, run_id: Uuid) -> Result<LockToken, StoreError>;

    /// Release a lock. Fails with `StoreError::LockMismatch` for a stale token.
    async fn release_lock(&self, token: LockToken) -> Result<(), StoreError>;

    /// Ids of every stored run.
    async fn list(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Record a cancellation request for a run whose lock is held elsewhere.
    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError>;

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError>;
}
