//! Filesystem run store.
//!
//! Layout under the root directory:
//!
//! - `<run_id>.json`: the run document, replaced atomically on save
//! - `<run_id>.lock`: present while a worker holds the run; a JSON lease with
//!   the token and when it was acquired and last renewed
//! - `<run_id>.cancel`: present once cancellation was requested
//!
//! A lease not renewed within the lock TTL is stale. The next acquirer moves
//! it aside, confirms it moved the stale lease and not a fresh one, and takes
//! the lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{LockToken, RunStore, DEFAULT_LOCK_TTL};
use crate::error::StoreError;
use crate::pipeline::Run;

/// Contents of a `.lock` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockLease {
    token: Uuid,
    acquired_at: DateTime<Utc>,
    renewed_at: DateTime<Utc>,
}

impl LockLease {
    fn new(token: &LockToken) -> Self {
        Self {
            token: token.token,
            acquired_at: token.acquired_at,
            renewed_at: token.acquired_at,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        match self.renewed_at.checked_add_signed(ttl) {
            Some(expiry) => expiry < Utc::now(),
            None => false,
        }
    }
}

/// Run store keeping one JSON document per run in a directory.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
    lock_ttl: Duration,
}

impl FileRunStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            lock_ttl: DEFAULT_LOCK_TTL,
        })
    }

    /// Sets how long a lease survives without renewal.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.json", run_id))
    }

    fn lock_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.lock", run_id))
    }

    fn cancel_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.cancel", run_id))
    }

    /// Write `data` to `path` through a temporary file and a rename.
    async fn replace(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Read a lease. A lease that cannot be parsed, e.g. from a holder that
    /// crashed mid-write, is dated by the file's modification time.
    async fn read_lease(&self, path: &Path) -> Result<Option<LockLease>, StoreError> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Ok(lease) = serde_json::from_slice(&data) {
            return Ok(Some(lease));
        }
        let modified: DateTime<Utc> = match fs::metadata(path).await {
            Ok(meta) => meta.modified()?.into(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(LockLease {
            token: Uuid::nil(),
            acquired_at: modified,
            renewed_at: modified,
        }))
    }

    async fn create_lock(&self, token: &LockToken) -> Result<(), StoreError> {
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path(token.run_id))
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Locked(token.run_id))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&serde_json::to_vec(&LockLease::new(token))?)
            .await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Remove the run's lock file if its lease expired. Returns whether the
    /// lock is now free to create.
    async fn break_stale_lock(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let path = self.lock_path(run_id);
        let Some(stale) = self.read_lease(&path).await? else {
            return Ok(true);
        };
        if !stale.is_expired(self.lock_ttl) {
            return Ok(false);
        }

        let aside = self
            .root
            .join(format!("{}.lock.stale-{}", run_id, Uuid::new_v4().simple()));
        match fs::rename(&path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let moved = self.read_lease(&aside).await?;
        if moved.map(|lease| lease.token) != Some(stale.token) {
            // Another worker replaced the lease in between; hand it back.
            if let Err(e) = fs::hard_link(&aside, &path).await {
                tracing::debug!(run_id = %run_id, error = %e, "Lock was retaken meanwhile");
            }
            fs::remove_file(&aside).await?;
            return Ok(false);
        }

        fs::remove_file(&aside).await?;
        tracing::warn!(
            run_id = %run_id,
            acquired_at = %stale.acquired_at,
            renewed_at = %stale.renewed_at,
            "Broke stale run lock"
        );
        Ok(true)
    }

    /// Fail with `LockMismatch` unless `token` holds the run's lock.
    async fn check_lease(&self, token: &LockToken) -> Result<LockLease, StoreError> {
        match self.read_lease(&self.lock_path(token.run_id)).await? {
            Some(lease) if lease.token == token.token => Ok(lease),
            _ => Err(StoreError::LockMismatch(token.run_id)),
        }
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn load(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let data = match fs::read(self.run_path(run_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(run_id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    async fn save(&self, run: &Run) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(run)?;
        self.replace(&self.run_path(run.id), &data).await
    }

    async fn save_locked(&self, run: &Run, token: &LockToken) -> Result<(), StoreError> {
        let mut lease = self.check_lease(token).await?;
        lease.renewed_at = Utc::now();
        self.replace(&self.lock_path(run.id), &serde_json::to_vec(&lease)?)
            .await?;
        self.save(run).await
    }

    async fn acquire_lock(&self, run_id: Uuid) -> Result<LockToken, StoreError> {
        let token = LockToken::new(run_id);
        match self.create_lock(&token).await {
            Ok(()) => return Ok(token),
            Err(StoreError::Locked(_)) => {}
            Err(e) => return Err(e),
        }
        if !self.break_stale_lock(run_id).await? {
            return Err(StoreError::Locked(run_id));
        }
        self.create_lock(&token).await?;
        Ok(token)
    }

    async fn release_lock(&self, token: LockToken) -> Result<(), StoreError> {
        self.check_lease(&token).await?;
        fs::remove_file(self.lock_path(token.run_id)).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError> {
        fs::write(self.cancel_path(run_id), b"").await?;
        Ok(())
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.cancel_path(run_id)).await?)
    }
}
