//! Worker pool that advances independent runs in parallel.
//!
//! Runs are submitted by id to an in-process queue. Each worker pulls the
//! next id and drives that run until it stops being runnable. Workers share
//! no run state; two workers never advance the same run at once because
//! every step happens under the store's per-run lock.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ run ids
//!                      ┌──────▼───────┐
//!                      │  mpsc queue  │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──────────── RunStore (locks) ─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reelforge::scheduler::{WorkerPool, WorkerPoolConfig};
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(4), Arc::new(orchestrator));
//! pool.start()?;
//! pool.submit(run.id).await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

pub mod worker_pool;

pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
