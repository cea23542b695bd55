use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::instrument;

use super::bus::{EventBus, SubscriptionGuard};
use super::credentials::{CredentialResolver, ResolutionReport};
use super::dispatcher::JobDispatcher;
use super::state_machine::{NewRun, RunStateMachine, StepReport};
use super::undo::{UndoLedger, UndoReport};
use crate::config::AppConfig;
use crate::engine::domain::effects::RunEffect;
use crate::engine::domain::events::{EventType, RunEvent, STATUS_CHANNEL, STEPS_CHANNEL};
use crate::engine::domain::identity::{CallerContext, ChatItem};
use crate::engine::domain::runs::{PendingQuestion, PlanStep, Run, RunStatus, Step};
use crate::engine::persistence::RunStore;
use crate::engine::queue::{ClaimedJob, JobCounts, JobOutcome, WorkQueue};
use crate::engine::security::authz::Authorizer;
use crate::engine::security::claims::UserClaims;
use crate::engine::security::token::{JobTokenClaims, TokenIssuer};
use crate::engine::tools::{ToolContext, ToolRegistry};
use crate::error::{EngineError, Result};

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    #[serde(flatten)]
    pub run: NewRun,
    #[serde(default)]
    pub team_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReport {
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub diff: Option<Value>,
    /// Questions the planner needs answered before execution.
    #[serde(default)]
    pub questions: Vec<PendingQuestion>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: RunStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub questions: Option<Vec<PendingQuestion>>,
    /// Answers the worker collected itself; only read with `PENDING`.
    #[serde(default)]
    pub answers: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectReport {
    #[serde(default)]
    pub step_id: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default = "default_can_undo")]
    pub can_undo: bool,
}

fn default_can_undo() -> bool {
    true
}

/// Entry point for API handlers and worker callbacks.
#[derive(Debug, Clone)]
pub struct RunManager {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn WorkQueue>,
    authz: Arc<Authorizer>,
    issuer: Arc<TokenIssuer>,
    bus: Arc<EventBus>,
    machine: Arc<RunStateMachine>,
    credentials: Arc<CredentialResolver>,
    ledger: UndoLedger,
    tools: Arc<ToolRegistry>,
    default_timezone: String,
    max_delay_ms: u64,
}

impl RunManager {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn RunStore>,
        queue: Arc<dyn WorkQueue>,
        tools: ToolRegistry,
    ) -> Self {
        let issuer = Arc::new(TokenIssuer::new(config.tokens.clone()));
        let authz = Arc::new(Authorizer::new(
            Arc::clone(&store),
            config.policy.auto_enroll_team_members,
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&issuer),
            Arc::clone(&authz),
            config.dispatch.clone(),
        ));
        let bus = Arc::new(EventBus::new(&config.bus));
        let machine = Arc::new(RunStateMachine::new(
            Arc::clone(&store),
            dispatcher,
            Arc::clone(&bus),
        ));
        let credentials = Arc::new(CredentialResolver::new(Arc::clone(&store), Arc::clone(&machine)));

        Self {
            ledger: UndoLedger::new(Arc::clone(&store)),
            store,
            queue,
            authz,
            issuer,
            bus,
            machine,
            credentials,
            tools: Arc::new(tools),
            default_timezone: config.tokens.default_timezone.clone(),
            max_delay_ms: config.dispatch.max_delay_ms,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Load a run the caller may act on, with the caller context for it.
    async fn owned_run(&self, claims: &UserClaims, run_id: &str) -> Result<(Run, CallerContext)> {
        let user = self.authz.resolve_identity(Some(claims)).await?;
        let run = self.authz.check_ownership(run_id, &user.subject).await?;
        let caller = CallerContext::new(&user, run.team_id);
        Ok((run, caller))
    }

    // =========================================================================
    // User operations
    // =========================================================================

    #[instrument(skip(self, claims, request), fields(sub = %claims.sub))]
    pub async fn create_run(&self, claims: &UserClaims, request: CreateRunRequest) -> Result<Run> {
        if request.run.prompt.trim().is_empty() {
            return Err(EngineError::BadRequest("prompt must not be empty".into()));
        }
        if request.run.delay_ms > self.max_delay_ms {
            return Err(EngineError::BadRequest(format!(
                "delayMs must not exceed {}",
                self.max_delay_ms
            )));
        }
        let caller = self.authz.caller_context(Some(claims), request.team_id).await?;
        self.machine.create_run(request.run, &caller).await
    }

    pub async fn get_run(&self, claims: &UserClaims, run_id: &str) -> Result<Run> {
        self.owned_run(claims, run_id).await.map(|(run, _)| run)
    }

    pub async fn list_steps(&self, claims: &UserClaims, run_id: &str) -> Result<Vec<Step>> {
        self.owned_run(claims, run_id).await?;
        Ok(self.store.list_steps(run_id).await?)
    }

    #[instrument(skip(self, claims, approved_steps))]
    pub async fn approve(&self, claims: &UserClaims, run_id: &str, approved_steps: Vec<String>) -> Result<Run> {
        let (_, caller) = self.owned_run(claims, run_id).await?;
        self.machine.approve_steps(run_id, approved_steps, &caller).await
    }

    #[instrument(skip(self, claims, answers))]
    pub async fn submit_answers(
        &self,
        claims: &UserClaims,
        run_id: &str,
        answers: Map<String, Value>,
    ) -> Result<Run> {
        let (_, caller) = self.owned_run(claims, run_id).await?;
        self.machine.answer_questions(run_id, answers, &caller).await
    }

    #[instrument(skip(self, claims))]
    pub async fn cancel(&self, claims: &UserClaims, run_id: &str) -> Result<Run> {
        self.owned_run(claims, run_id).await?;
        self.machine.cancel(run_id).await
    }

    /// Compensate through registered tools, then mark effects undone.
    #[instrument(skip(self, claims))]
    pub async fn undo(&self, claims: &UserClaims, run_id: &str) -> Result<UndoReport> {
        let (run, caller) = self.owned_run(claims, run_id).await?;
        let tz = self
            .store
            .get_user(run.user_id)
            .await?
            .and_then(|u| u.timezone)
            .unwrap_or_else(|| self.default_timezone.clone());
        let scopes: BTreeSet<String> = run
            .policy_snapshot
            .iter()
            .flat_map(|p| p.allowlist.tools.iter())
            .map(|tool| format!("tool:{tool}"))
            .collect();
        let ctx = ToolContext {
            run_id: run.id.clone(),
            user_id: run.user_id,
            team_id: run.team_id,
            scopes,
            trace_id: caller.trace_id,
            tz,
            meta: run.config.meta.clone(),
        };
        self.ledger.compensate_and_undo(run_id, &self.tools, &ctx).await
    }

    pub async fn refresh_credentials(&self, claims: &UserClaims, run_id: &str) -> Result<ResolutionReport> {
        let (run, _) = self.owned_run(claims, run_id).await?;
        self.credentials
            .re_resolve_step_credentials(run_id, run.user_id)
            .await
    }

    pub async fn chat_item(&self, claims: &UserClaims, run_id: &str) -> Result<ChatItem> {
        self.owned_run(claims, run_id).await?;
        self.store
            .get_chat_item(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no chat item for run `{run_id}`")))
    }

    /// Live events for one run on both channels. Ends after
    /// `run_completed`; dropping the stream unsubscribes.
    pub async fn subscribe(
        &self,
        claims: &UserClaims,
        run_id: &str,
    ) -> Result<BoxStream<'static, RunEvent>> {
        self.owned_run(claims, run_id).await?;

        let (tx, mut rx) = mpsc::channel::<RunEvent>(STREAM_BUFFER);
        let guards: Vec<SubscriptionGuard> = [STATUS_CHANNEL, STEPS_CHANNEL]
            .into_iter()
            .map(|channel| {
                let tx = tx.clone();
                let subscription = self.bus.subscribe_fn(Some(run_id), channel, move |event| {
                    let tx = tx.clone();
                    async move {
                        tx.send(event)
                            .await
                            .map_err(|_| anyhow::anyhow!("stream receiver closed"))
                    }
                });
                SubscriptionGuard::new(Arc::clone(&self.bus), subscription)
            })
            .collect();

        Ok(async_stream::stream! {
            let _guards = guards;
            while let Some(event) = rx.recv().await {
                let done = event.event_type == EventType::RunCompleted.as_str();
                yield event;
                if done {
                    break;
                }
            }
        }
        .boxed())
    }

    pub async fn queue_counts(&self) -> Result<JobCounts> {
        Ok(self.queue.counts().await?)
    }

    // =========================================================================
    // Worker job intake (worker-secret authenticated)
    // =========================================================================

    pub async fn claim_jobs(&self, limit: usize) -> Result<Vec<ClaimedJob>> {
        let jobs = self.queue.claim(limit).await?;
        if !jobs.is_empty() {
            tracing::debug!(claimed = jobs.len(), "jobs claimed");
            metrics::counter!("queue.claimed").increment(jobs.len() as u64);
        }
        Ok(jobs)
    }

    pub async fn finish_job(&self, job_id: &str, outcome: JobOutcome) -> Result<()> {
        self.queue
            .finish(job_id, outcome)
            .await
            .map_err(|e| EngineError::NotFound(e.to_string()))?;
        tracing::info!(job_id, ?outcome, "job finished");
        Ok(())
    }

    // =========================================================================
    // Worker callbacks (job-token authenticated)
    // =========================================================================

    pub fn verify_job_token(&self, token: &str, run_id: &str) -> Result<JobTokenClaims> {
        self.issuer.verify_for_run(token, run_id)
    }

    #[instrument(skip(self, token, report))]
    pub async fn persist_plan(&self, token: &str, run_id: &str, report: PlanReport) -> Result<Run> {
        self.verify_job_token(token, run_id)?;
        let run = self.machine.persist_plan(run_id, report.plan, report.diff).await?;
        if report.questions.is_empty() {
            return Ok(run);
        }
        self.machine.await_input(run_id, report.questions).await
    }

    #[instrument(skip(self, token, report), fields(status = %report.status))]
    pub async fn report_status(&self, token: &str, run_id: &str, report: StatusReport) -> Result<Run> {
        self.verify_job_token(token, run_id)?;
        match (report.status, report.questions, report.answers) {
            (RunStatus::AwaitingInput, Some(questions), _) => self.machine.await_input(run_id, questions).await,
            (RunStatus::Pending, _, Some(answers)) => self.machine.store_answers(run_id, answers).await,
            (status, _, _) => self.machine.transition(run_id, status, report.reason).await,
        }
    }

    pub async fn report_step(
        &self,
        token: &str,
        run_id: &str,
        step_id: &str,
        report: StepReport,
    ) -> Result<Step> {
        self.verify_job_token(token, run_id)?;
        self.machine.report_step(run_id, step_id, report).await
    }

    pub async fn record_effect(&self, token: &str, run_id: &str, report: EffectReport) -> Result<RunEffect> {
        self.verify_job_token(token, run_id)?;
        let mut effect = RunEffect::new(run_id, report.step_id, &report.tool, report.result);
        effect.can_undo = report.can_undo;
        self.ledger.record_effect(effect).await
    }
}
