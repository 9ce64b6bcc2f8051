//! In-memory run store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LockToken, RunStore};
use crate::error::StoreError;
use crate::pipeline::Run;

/// Run store backed by process-local maps.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Uuid, Run>>,
    locks: Mutex<HashMap<Uuid, Uuid>>,
    cancels: Mutex<HashSet<Uuid>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a run's lock is currently held.
    pub async fn is_locked(&self, run_id: Uuid) -> bool {
        self.locks.lock().await.contains_key(&run_id)
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn load(&self, run_id: Uuid) -> Result<Run, StoreError> {
        self.runs
            .lock()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::NotFound(run_id))
    }

    async fn save(&self, run: &Run) -> Result<(), StoreError> {
        self.runs.lock().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn save_locked(&self, run: &Run, token: &LockToken) -> Result<(), StoreError> {
        let locks = self.locks.lock().await;
        if locks.get(&run.id) != Some(&token.token) {
            return Err(StoreError::LockMismatch(run.id));
        }
        self.runs.lock().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn acquire_lock(&self, run_id: Uuid) -> Result<LockToken, StoreError> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(&run_id) {
            return Err(StoreError::Locked(run_id));
        }
        let token = LockToken::new(run_id);
        locks.insert(run_id, token.token);
        Ok(token)
    }

    async fn release_lock(&self, token: LockToken) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().await;
        match locks.get(&token.run_id) {
            Some(held) if *held == token.token => {
                locks.remove(&token.run_id);
                Ok(())
            }
            _ => Err(StoreError::LockMismatch(token.run_id)),
        }
    }

    async fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids: Vec<Uuid> = self.runs.lock().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.cancels.lock().await.insert(run_id);
        Ok(())
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.cancels.lock().await.contains(&run_id))
    }
}
