//! Redis-backed run store.
//!
//! Keys, all under a configurable prefix:
//!
//! - `{prefix}:run:{id}`: run JSON
//! - `{prefix}:runs`: set of run ids
//! - `{prefix}:lock:{id}`: lock token, written with `SET NX PX`
//! - `{prefix}:cancel:{id}`: cancellation marker
//!
//! Locks expire after the configured TTL so a crashed worker cannot hold a
//! run forever. Release and holder writes compare the token atomically in Lua
//! scripts; a holder write also renews the lock's TTL.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{LockToken, RunStore, DEFAULT_LOCK_TTL};
use crate::error::StoreError;
use crate::pipeline::Run;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const SAVE_LOCKED_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call("SET", KEYS[2], ARGV[2])
redis.call("SADD", KEYS[3], ARGV[3])
redis.call("PEXPIRE", KEYS[1], ARGV[4])
return 1
"#;

/// Run store backed by Redis.
pub struct RedisRunStore {
    redis: ConnectionManager,
    prefix: String,
    lock_ttl: Duration,
}

impl RedisRunStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Key prefix shared by every key this store writes
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Sets how long an unreleased lock survives.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn run_key(&self, run_id: Uuid) -> String {
        format!("{}:run:{}", self.prefix, run_id)
    }

    fn index_key(&self) -> String {
        format!("{}:runs", self.prefix)
    }

    fn lock_key(&self, run_id: Uuid) -> String {
        format!("{}:lock:{}", self.prefix, run_id)
    }

    fn cancel_key(&self, run_id: Uuid) -> String {
        format!("{}:cancel:{}", self.prefix, run_id)
    }
}

#[async_trait]
impl RunStore for RedisRunStore {
    async fn load(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.run_key(run_id)).await?;
        match data {
            Some(s) => Ok(serde_json::from_str(&s)?),
            None => Err(StoreError::NotFound(run_id)),
        }
    }

    async fn save(&self, run: &Run) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(run)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.run_key(run.id), serialized)
            .sadd(self.index_key(), run.id.to_string());
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn save_locked(&self, run: &Run, token: &LockToken) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(run)?;
        let mut conn = self.redis.clone();
        let written: i64 = redis::Script::new(SAVE_LOCKED_SCRIPT)
            .key(self.lock_key(run.id))
            .key(self.run_key(run.id))
            .key(self.index_key())
            .arg(token.token.to_string())
            .arg(serialized)
            .arg(run.id.to_string())
            .arg(self.lock_ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if written == 0 {
            return Err(StoreError::LockMismatch(run.id));
        }
        Ok(())
    }

    async fn acquire_lock(&self, run_id: Uuid) -> Result<LockToken, StoreError> {
        let token = LockToken::new(run_id);
        let mut conn = self.redis.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(run_id))
            .arg(token.token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(self.lock_ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        match acquired {
            Some(_) => Ok(token),
            None => Err(StoreError::Locked(run_id)),
        }
    }

    async fn release_lock(&self, token: LockToken) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(token.run_id))
            .arg(token.token.to_string())
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(StoreError::LockMismatch(token.run_id));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(self.index_key()).await?;
        let mut ids: Vec<Uuid> = members
            .iter()
            .filter_map(|m| Uuid::parse_str(m).ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.cancel_key(run_id), 1).await?;
        Ok(())
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(self.cancel_key(run_id)).await?;
        Ok(exists)
    }
}
