use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{ClaimedJob, JobCounts, JobHandle, JobOptions, JobOutcome, Retention, WorkQueue};

pub const DEFAULT_CAPACITY: usize = 10_000;

/// A job sitting in the in-process queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub handle: JobHandle,
    pub payload: Value,
    pub options: JobOptions,
}

/// In-process queue used by the server and in tests. Workers drain it
/// through `claim` and `finish`.
///
/// Waiting plus active jobs are capped at `capacity`; enqueues beyond it
/// fail. Finished history is trimmed to the retention caps of the last job
/// finished, and ids are forgotten once their job leaves history.
#[derive(Debug)]
pub struct MemoryQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    active: Vec<QueuedJob>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    known_ids: HashSet<String>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Ids currently tracked for duplicate detection.
    pub fn tracked_ids(&self) -> usize {
        self.state.lock().unwrap().known_ids.len()
    }

    /// Snapshot of every job not yet claimed.
    pub fn pending(&self) -> Vec<QueuedJob> {
        let state = self.state.lock().unwrap();
        state.pending.iter().cloned().collect()
    }

}

/// Drop the oldest entries past `keep` and forget their ids.
fn trim(history: &mut VecDeque<String>, keep: usize, known_ids: &mut HashSet<String>) {
    while history.len() > keep {
        if let Some(id) = history.pop_front() {
            known_ids.remove(&id);
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(
        &self,
        job_name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobHandle> {
        let mut state = self.state.lock().unwrap();
        if state.pending.len() + state.active.len() >= self.capacity {
            return Err(anyhow!("queue is full ({} jobs)", self.capacity));
        }
        if !state.known_ids.insert(options.job_id.clone()) {
            return Err(anyhow!("job `{}` already exists", options.job_id));
        }

        let enqueued_at = Utc::now();
        let delay = chrono::Duration::from_std(options.delay).unwrap_or_default();
        let handle = JobHandle {
            id: options.job_id.clone(),
            name: job_name.to_string(),
            enqueued_at,
            run_at: enqueued_at + delay,
        };
        state.pending.push_back(QueuedJob {
            handle: handle.clone(),
            payload,
            options,
        });
        Ok(handle)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let now = Utc::now();
        let state = self.state.lock().unwrap();
        let delayed = state
            .pending
            .iter()
            .filter(|job| job.handle.run_at > now)
            .count();
        Ok(JobCounts {
            waiting: state.pending.len() - delayed,
            delayed,
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        })
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let mut claimed = Vec::new();
        let mut index = 0;
        while index < state.pending.len() && claimed.len() < limit {
            if state.pending[index].handle.run_at > now {
                index += 1;
                continue;
            }
            if let Some(job) = state.pending.remove(index) {
                claimed.push(ClaimedJob {
                    handle: job.handle.clone(),
                    payload: job.payload.clone(),
                    attempts: job.options.attempts,
                });
                state.active.push(job);
            }
        }
        Ok(claimed)
    }

    async fn finish(&self, job_id: &str, outcome: JobOutcome) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let position = state
            .active
            .iter()
            .position(|job| job.handle.id == job_id)
            .ok_or_else(|| anyhow!("job `{job_id}` is not active"))?;
        let job = state.active.remove(position);
        let Retention {
            keep_completed,
            keep_failed,
        } = job.options.retention;

        match outcome {
            JobOutcome::Completed => {
                state.completed.push_back(job.handle.id);
                trim(&mut state.completed, keep_completed, &mut state.known_ids);
            }
            JobOutcome::Failed => {
                state.failed.push_back(job.handle.id);
                trim(&mut state.failed, keep_failed, &mut state.known_ids);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::queue::Backoff;
    use std::time::Duration;

    fn options(id: &str, delay_ms: u64) -> JobOptions {
        JobOptions {
            job_id: id.to_string(),
            delay: Duration::from_millis(delay_ms),
            attempts: 3,
            backoff: Backoff::Exponential { delay_ms: 5000 },
            retention: Retention {
                keep_completed: 2,
                keep_failed: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_duplicate_job_ids_are_rejected() {
        let queue = MemoryQueue::new();
        queue
            .enqueue("run", Value::Null, options("job-1", 0))
            .await
            .unwrap();
        assert!(queue
            .enqueue("run", Value::Null, options("job-1", 0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_history_is_bounded_by_retention() {
        let queue = MemoryQueue::new();
        for i in 0..4 {
            queue
                .enqueue("run", Value::Null, options(&format!("job-{i}"), 0))
                .await
                .unwrap();
        }
        queue
            .enqueue("run", Value::Null, options("later", 60_000))
            .await
            .unwrap();

        let claimed = queue.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 4);
        for job in &claimed {
            queue
                .finish(&job.handle.id, JobOutcome::Completed)
                .await
                .unwrap();
        }

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.active, 0);
        // Two retained in history plus the delayed job.
        assert_eq!(queue.tracked_ids(), 3);
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_order() {
        let queue = MemoryQueue::new();
        for id in ["a", "b", "c"] {
            queue.enqueue("run", Value::Null, options(id, 0)).await.unwrap();
        }
        let first = queue.claim(2).await.unwrap();
        let ids: Vec<&str> = first.iter().map(|job| job.handle.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(first[0].attempts, 3);

        let rest = queue.claim(2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(queue.claim(2).await.unwrap().is_empty());
        assert!(queue.finish("nope", JobOutcome::Failed).await.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_beyond_capacity_fails() {
        let queue = MemoryQueue::with_capacity(2);
        queue.enqueue("run", Value::Null, options("a", 0)).await.unwrap();
        queue.enqueue("run", Value::Null, options("b", 0)).await.unwrap();
        assert!(queue.enqueue("run", Value::Null, options("c", 0)).await.is_err());

        // Active jobs still count; finishing one frees a slot.
        let claimed = queue.claim(1).await.unwrap();
        assert!(queue.enqueue("run", Value::Null, options("c", 0)).await.is_err());
        queue.finish(&claimed[0].handle.id, JobOutcome::Completed).await.unwrap();
        assert!(queue.enqueue("run", Value::Null, options("c", 0)).await.is_ok());
    }
}
