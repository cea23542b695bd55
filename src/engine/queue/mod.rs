//! Work-queue boundary.
//!
//! The core only needs to enqueue a job with an id, a delay and a retry
//! policy. Whatever executes the job lives behind this trait.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod memory;

/// Retry backoff between attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Wait before retry number `retry` (1-based).
    pub fn delay_for_retry(self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { delay_ms } => {
                let factor = 2u64.saturating_pow(retry.saturating_sub(1));
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }
}

/// How much finished-job history the queue keeps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retention {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub job_id: String,
    pub delay: Duration,
    pub attempts: u32,
    pub backoff: Backoff,
    pub retention: Retention,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: String,
    pub name: String,
    pub enqueued_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
}

/// A job handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedJob {
    pub handle: JobHandle,
    pub payload: Value,
    pub attempts: u32,
}

/// Queue occupancy. Observability only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed,
}

#[async_trait]
pub trait WorkQueue: Send + Sync + std::fmt::Debug {
    async fn enqueue(&self, job_name: &str, payload: Value, options: JobOptions)
    -> Result<JobHandle>;

    async fn counts(&self) -> Result<JobCounts>;

    /// Take up to `limit` jobs whose delay has elapsed, oldest first.
    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedJob>>;

    /// Move a claimed job into finished history.
    async fn finish(&self, job_id: &str, outcome: JobOutcome) -> Result<()>;
}
