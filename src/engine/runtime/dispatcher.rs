//! Idempotent job dispatch.
//!
//! Loads a run, derives its policy and scopes, mints a job token and enqueues
//! a uniquely-identified job. Queue failures surface as
//! [`EngineError::Dispatch`] so callers can roll back.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::config::DispatchConfig;
use crate::engine::domain::identity::CallerContext;
use crate::engine::domain::policy::PolicySnapshot;
use crate::engine::domain::runs::{Run, RunMode};
use crate::engine::persistence::RunStore;
use crate::engine::queue::{Backoff, JobHandle, JobOptions, Retention, WorkQueue};
use crate::engine::security::authz::Authorizer;
use crate::engine::security::token::{MintParams, TokenIssuer};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub delay_ms: u64,
    /// Carried to the worker verbatim, e.g. approval or resume context.
    pub scratch: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Value>>,
}

/// What a worker receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub run_id: String,
    pub mode: RunMode,
    pub input: JobInput,
    pub scopes: BTreeSet<String>,
    pub token: String,
    pub token_expires_at: DateTime<Utc>,
    pub policy: PolicySnapshot,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch: Option<Value>,
    pub caller_context: CallerContext,
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub job: JobHandle,
    pub payload: JobPayload,
}

pub struct JobDispatcher {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn WorkQueue>,
    issuer: Arc<TokenIssuer>,
    authz: Arc<Authorizer>,
    config: DispatchConfig,
    last_stamp: AtomicU64,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Prompt from `config.input.prompt` when set, else the run's own. Messages
/// pass through only when already an array.
fn job_input(run: &Run) -> JobInput {
    let input = run.config.input.as_ref();
    let prompt = input
        .and_then(|i| i.prompt.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| run.prompt.clone());

    let messages = match input.and_then(|i| i.messages.as_ref()) {
        Some(Value::Array(items)) => Some(items.clone()),
        Some(_) => None,
        None if !run.messages.is_empty() => run
            .messages
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .ok(),
        None => None,
    };
    JobInput { prompt, messages }
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn WorkQueue>,
        issuer: Arc<TokenIssuer>,
        authz: Arc<Authorizer>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            queue,
            issuer,
            authz,
            config,
            last_stamp: AtomicU64::new(0),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Millisecond stamp, strictly increasing across calls in this process.
    fn next_stamp(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    /// `run-<id>-mode-<mode>-<base36 ms>`.
    pub fn job_id(&self, run_id: &str, mode: RunMode) -> String {
        format!("run-{run_id}-mode-{mode}-{}", to_base36(self.next_stamp()))
    }

    fn run_lock(&self, run_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().unwrap();
        Arc::clone(locks.entry(run_id.to_string()).or_default())
    }

    /// Drop the run's lock entry once no other dispatch holds or awaits it.
    fn release_run_lock(&self, run_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.run_locks.lock().unwrap();
        drop(lock);
        if locks.get(run_id).is_some_and(|held| Arc::strong_count(held) == 1) {
            locks.remove(run_id);
        }
    }

    /// Runs with a live per-run lock entry.
    pub fn locked_runs(&self) -> usize {
        self.run_locks.lock().unwrap().len()
    }

    #[instrument(skip(self, options, caller), fields(user_id = caller.user_id, trace_id = %caller.trace_id))]
    pub async fn enqueue(
        &self,
        run_id: &str,
        options: DispatchOptions,
        caller: &CallerContext,
    ) -> Result<Dispatched> {
        if !self.config.serialize_per_run {
            return self.dispatch(run_id, options, caller).await;
        }

        let lock = self.run_lock(run_id);
        let result = {
            let _serialized = lock.lock().await;
            self.dispatch(run_id, options, caller).await
        };
        self.release_run_lock(run_id, lock);
        result
    }

    async fn dispatch(
        &self,
        run_id: &str,
        options: DispatchOptions,
        caller: &CallerContext,
    ) -> Result<Dispatched> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::run_not_found(run_id))?;

        let policy = self
            .authz
            .build_policy_snapshot(run.team_id, &run.config.tool_allowlist)
            .await?;
        let scopes = Authorizer::derive_scopes(&run, &run.config, &policy);

        let user_timezone = self
            .store
            .get_user(run.user_id)
            .await?
            .and_then(|user| user.timezone);

        let issued = self.issuer.mint(MintParams {
            run_id: run.id.clone(),
            user_sub: caller.user_sub.clone(),
            user_id: caller.user_id,
            team_id: run.team_id,
            scopes: scopes.clone(),
            trace_id: caller.trace_id.clone(),
            meta: run.config.meta.clone(),
            user_timezone,
            dispatch_delay_ms: options.delay_ms,
        })?;

        let payload = JobPayload {
            run_id: run.id.clone(),
            mode: run.mode,
            input: job_input(&run),
            scopes,
            token: issued.token,
            token_expires_at: issued.expires_at,
            policy: policy.clone(),
            meta: run.config.meta.clone(),
            scratch: options.scratch,
            caller_context: caller.clone(),
        };

        let job_options = JobOptions {
            job_id: self.job_id(&run.id, run.mode),
            delay: Duration::from_millis(options.delay_ms),
            attempts: self.config.attempts,
            backoff: Backoff::Exponential {
                delay_ms: self.config.backoff_ms,
            },
            retention: Retention {
                keep_completed: self.config.keep_completed,
                keep_failed: self.config.keep_failed,
            },
        };
        let job_id = job_options.job_id.clone();
        let body = serde_json::to_value(&payload).map_err(|e| EngineError::Internal(e.into()))?;

        let job = match self.queue.enqueue(&self.config.job_name, body, job_options).await {
            Ok(job) => job,
            Err(source) => {
                tracing::error!(job_id, error = %source, "enqueue failed");
                metrics::counter!("dispatch.failed").increment(1);
                return Err(EngineError::Dispatch {
                    run_id: run.id,
                    source,
                });
            }
        };
        tracing::info!(job_id = %job.id, delay_ms = options.delay_ms, "run dispatched");
        metrics::counter!("dispatch.enqueued").increment(1);

        let attached = self
            .store
            .update_run(
                &run.id,
                Box::new(move |run| {
                    run.policy_snapshot = Some(policy);
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = attached {
            tracing::warn!(error = %e, "could not attach policy snapshot");
        }

        Ok(Dispatched { job, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::runtime::testing::{Fixture, FailingQueue};
    use crate::engine::domain::runs::RunInput;
    use crate::engine::queue::memory::MemoryQueue;
    use crate::engine::queue::{ClaimedJob, JobCounts, JobOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Records how many enqueues overlap.
    #[derive(Debug, Default)]
    struct OverlapQueue {
        inner: MemoryQueue,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl WorkQueue for OverlapQueue {
        async fn enqueue(&self, job_name: &str, payload: Value, options: JobOptions) -> anyhow::Result<JobHandle> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let result = self.inner.enqueue(job_name, payload, options).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn counts(&self) -> anyhow::Result<JobCounts> {
            self.inner.counts().await
        }

        async fn claim(&self, limit: usize) -> anyhow::Result<Vec<ClaimedJob>> {
            self.inner.claim(limit).await
        }

        async fn finish(&self, job_id: &str, outcome: JobOutcome) -> anyhow::Result<()> {
            self.inner.finish(job_id, outcome).await
        }
    }

    async fn overlap_peak(serialize_per_run: bool) -> (usize, BTreeSet<String>, usize) {
        let fx = Fixture::new().await;
        fx.store.create_run(&Run::new("r1", RunMode::Auto, "p", 1, None)).await.unwrap();
        let queue = Arc::new(OverlapQueue::default());
        let mut config = fx.config.dispatch.clone();
        config.serialize_per_run = serialize_per_run;
        let dispatcher = JobDispatcher::new(
            fx.store.clone(),
            queue.clone(),
            fx.issuer.clone(),
            fx.authz.clone(),
            config,
        );

        let caller = fx.caller();
        let calls = (0..8).map(|_| dispatcher.enqueue("r1", DispatchOptions::default(), &caller));
        let ids = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().job.id)
            .collect();
        (queue.peak.load(Ordering::SeqCst), ids, dispatcher.locked_runs())
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn test_job_input_prefers_config_prompt() {
        let mut run = Run::new("r1", RunMode::Auto, "stored", 1, None);
        assert_eq!(job_input(&run).prompt, "stored");
        assert!(job_input(&run).messages.is_none());

        run.config.input = Some(RunInput {
            prompt: Some("override".into()),
            messages: Some(json!("not an array")),
        });
        let input = job_input(&run);
        assert_eq!(input.prompt, "override");
        assert!(input.messages.is_none());

        run.config.input = Some(RunInput {
            prompt: None,
            messages: Some(json!([{ "role": "user", "content": "hi" }])),
        });
        assert_eq!(job_input(&run).messages.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_builds_payload_and_attaches_policy() {
        let fx = Fixture::new().await;
        let mut run = Run::new("r1", RunMode::Auto, "book a meeting", 1, Some(10));
        run.config.meta.insert("tz".into(), json!("Asia/Tokyo"));
        fx.store.create_run(&run).await.unwrap();

        let dispatched = fx
            .dispatcher
            .enqueue("r1", DispatchOptions { delay_ms: 1500, scratch: None }, &fx.caller())
            .await
            .unwrap();

        assert!(dispatched.job.id.starts_with("run-r1-mode-auto-"));
        assert!(dispatched.payload.scopes.contains("runs:execute"));
        assert!(dispatched.payload.scopes.contains("tool:calendar.create"));

        let claims = fx.issuer.verify_for_run(&dispatched.payload.token, "r1").unwrap();
        assert_eq!(claims.tz, "Asia/Tokyo");
        assert_eq!(claims.exp - claims.iat, 900 + 2);

        let queued = fx.queue.pending();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].options.attempts, 3);
        assert_eq!(queued[0].options.backoff, Backoff::Exponential { delay_ms: 5000 });
        assert_eq!(queued[0].payload["input"]["prompt"], "book a meeting");

        let stored = fx.store.get_run("r1").await.unwrap().unwrap();
        assert!(stored.policy_snapshot.unwrap().allows("calendar.create"));
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_get_distinct_ids() {
        let fx = Fixture::new().await;
        fx.store.create_run(&Run::new("r1", RunMode::Auto, "p", 1, None)).await.unwrap();

        let caller = fx.caller();
        let calls = (0..8).map(|_| fx.dispatcher.enqueue("r1", DispatchOptions::default(), &caller));
        let results = futures::future::join_all(calls).await;

        let ids: BTreeSet<String> = results.into_iter().map(|r| r.unwrap().job.id).collect();
        assert_eq!(ids.len(), 8);
    }

    #[tokio::test]
    async fn test_serialized_dispatch_never_overlaps_per_run() {
        let (peak, ids, locked) = overlap_peak(true).await;
        assert_eq!(peak, 1);
        assert_eq!(ids.len(), 8);
        assert_eq!(locked, 0);

        let (peak, ids, _) = overlap_peak(false).await;
        assert!(peak > 1);
        assert_eq!(ids.len(), 8);
    }

    #[tokio::test]
    async fn test_caller_scopes_do_not_widen_token() {
        let fx = Fixture::new().await;
        fx.store.create_run(&Run::new("r1", RunMode::Auto, "p", 1, None)).await.unwrap();
        let mut caller = fx.caller();
        caller.scopes.insert("admin:all".into());

        let dispatched = fx
            .dispatcher
            .enqueue("r1", DispatchOptions::default(), &caller)
            .await
            .unwrap();
        assert!(!dispatched.payload.scopes.contains("admin:all"));
        let claims = fx.issuer.verify_for_run(&dispatched.payload.token, "r1").unwrap();
        assert!(!claims.has_scope("admin:all"));
    }

    #[tokio::test]
    async fn test_queue_failure_is_a_dispatch_error() {
        let fx = Fixture::with_queue(Arc::new(FailingQueue)).await;
        fx.store.create_run(&Run::new("r1", RunMode::Auto, "p", 1, None)).await.unwrap();

        let err = fx
            .dispatcher
            .enqueue("r1", DispatchOptions::default(), &fx.caller())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Dispatch { .. }));

        let missing = fx
            .dispatcher
            .enqueue("nope", DispatchOptions::default(), &fx.caller())
            .await
            .unwrap_err();
        assert!(matches!(missing, EngineError::NotFound(_)));
    }
}
