//! Run status transitions and the output sub-document merges around them.
//!
//! Every status change goes through a guarded atomic update. Changes that
//! need a worker are paired with a dispatch: if the enqueue fails the status
//! change is rolled back, so a run is never left waiting on a job that does
//! not exist.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use tracing::instrument;

use super::bus::EventBus;
use super::dispatcher::{DispatchOptions, JobDispatcher};
use crate::engine::domain::events::{EventType, RunSnapshotPayload, StepEventPayload};
use crate::engine::domain::identity::{CallerContext, ChatItem, CredentialSnapshot};
use crate::engine::domain::runs::{
    AuditEvent, ChatTurn, PendingQuestion, PlanStep, ResumeFrom, Run, RunConfig, RunMode,
    RunStatus, Step, StepStatus,
};
use crate::engine::persistence::{RunStore, RunUpdate};
use crate::error::{EngineError, Result};

const CHAT_TITLE_MAX_CHARS: usize = 80;

/// Intent submitted by a user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    pub prompt: String,
    #[serde(default, deserialize_with = "lenient_mode")]
    pub mode: RunMode,
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub delay_ms: u64,
}

/// Unknown or missing modes fall back to `auto`.
fn lenient_mode<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<RunMode, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(RunMode::parse(raw.as_deref()))
}

/// A worker's report on one step.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub status: StepStatus,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Execution context for one plan step, rebuilt on resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionContext {
    pub plan_step_id: String,
    pub step_id: Option<String>,
    pub tool: String,
    pub args: Value,
    pub app_id: Option<String>,
    pub credential: Option<CredentialSnapshot>,
}

/// Required questions left unanswered or answered blank.
pub fn validate_answers(run: &Run, answers: &Map<String, Value>) -> BTreeMap<String, String> {
    let blank = |value: &Value| match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    };
    run.pending_questions()
        .iter()
        .filter(|q| q.required)
        .filter(|q| answers.get(&q.key).is_none_or(blank))
        .map(|q| (q.key.clone(), "answer required".to_string()))
        .collect()
}

fn chat_title(prompt: &str) -> String {
    let title: String = prompt.trim().chars().take(CHAT_TITLE_MAX_CHARS).collect();
    if title.is_empty() { "Untitled run".to_string() } else { title }
}

/// Merge answers into `output.scratch.answers`, clear `awaiting`, and
/// append `answered` then `validated` to the audit log.
fn record_answers(run: &mut Run, answers: &Map<String, Value>) {
    let keys: Vec<String> = answers.keys().cloned().collect();
    run.output.scratch.merge_answers(answers);
    run.output.awaiting = None;
    run.output.audit.record(AuditEvent::Answered, keys.clone());
    run.output.audit.record(AuditEvent::Validated, keys);
}

fn ensure_not_terminal(run: &Run) -> Result<()> {
    if run.status.is_terminal() {
        return Err(EngineError::BadRequest(format!(
            "run `{}` is {} and can no longer change",
            run.id, run.status
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct RunStateMachine {
    store: Arc<dyn RunStore>,
    dispatcher: Arc<JobDispatcher>,
    bus: Arc<EventBus>,
}

impl RunStateMachine {
    pub fn new(store: Arc<dyn RunStore>, dispatcher: Arc<JobDispatcher>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            dispatcher,
            bus,
        }
    }

    async fn update(
        &self,
        run_id: &str,
        mutation: impl FnOnce(&mut Run) -> Result<()> + Send + 'static,
    ) -> Result<RunUpdate> {
        let update = self
            .store
            .update_run(run_id, Box::new(move |run| mutation(run).map_err(anyhow::Error::from)))
            .await?;
        Ok(update)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::run_not_found(run_id))
    }

    #[instrument(skip(self, request, caller), fields(user_id = caller.user_id, mode = %request.mode))]
    pub async fn create_run(&self, request: NewRun, caller: &CallerContext) -> Result<Run> {
        let mut run = Run::new(
            uuid::Uuid::new_v4().to_string(),
            request.mode,
            request.prompt,
            caller.user_id,
            caller.team_id,
        );
        run.messages = request.messages;
        run.config = request.config;
        self.store.create_run(&run).await?;
        tracing::info!(run_id = %run.id, status = %run.status, "run created");
        self.announce_status(&run).await;

        let options = DispatchOptions {
            delay_ms: request.delay_ms,
            scratch: None,
        };
        match self.dispatcher.enqueue(&run.id, options, caller).await {
            Ok(_) => self.get_run(&run.id).await,
            Err(err) => {
                let reason = err.to_string();
                let failed = self
                    .update(&run.id, move |run| {
                        run.status = RunStatus::Failed;
                        run.output.scratch.failure_reason = Some(reason);
                        Ok(())
                    })
                    .await;
                match failed {
                    Ok(update) => self.announce_status(&update.after).await,
                    Err(e) => tracing::error!(run_id = %run.id, error = %e, "could not mark run failed"),
                }
                Err(err)
            }
        }
    }

    /// Apply a guarded mutation, then dispatch. A failed dispatch restores
    /// everything the mutation may touch unless someone else has moved the
    /// run on in between.
    async fn transition_and_dispatch(
        &self,
        run_id: &str,
        mutation: impl FnOnce(&mut Run) -> Result<()> + Send + 'static,
        options: DispatchOptions,
        caller: &CallerContext,
    ) -> Result<Run> {
        let update = self.update(run_id, mutation).await?;

        if let Err(err) = self.dispatcher.enqueue(run_id, options, caller).await {
            self.roll_back(&update).await;
            return Err(err);
        }

        let run = self.get_run(run_id).await.unwrap_or(update.after);
        self.announce_status(&run).await;
        Ok(run)
    }

    async fn roll_back(&self, update: &RunUpdate) {
        let before = update.before.clone();
        let expected = update.after.status;
        let restored = self
            .update(&before.id.clone(), move |run| {
                if run.status == expected {
                    run.status = before.status;
                    run.config = before.config;
                    run.answers = before.answers;
                    run.output.awaiting = before.output.awaiting;
                    run.output.audit = before.output.audit;
                    run.output.scratch.answers = before.output.scratch.answers;
                    run.output.scratch.approval_granted = before.output.scratch.approval_granted;
                    run.output.scratch.approved_at = before.output.scratch.approved_at;
                }
                Ok(())
            })
            .await;
        match restored {
            Ok(update) => tracing::warn!(
                run_id = %update.after.id,
                status = %update.after.status,
                "transition rolled back after dispatch failure"
            ),
            Err(e) => tracing::error!(run_id = %update.before.id, error = %e, "rollback failed"),
        }
    }

    #[instrument(skip(self, approved_steps, caller))]
    pub async fn approve_steps(
        &self,
        run_id: &str,
        approved_steps: Vec<String>,
        caller: &CallerContext,
    ) -> Result<Run> {
        let approved_at = Utc::now();
        let options = DispatchOptions {
            delay_ms: 0,
            scratch: Some(json!({ "approvalGranted": true, "approvedAt": approved_at })),
        };
        self.transition_and_dispatch(
            run_id,
            move |run| {
                if run.status != RunStatus::AwaitingApproval {
                    return Err(EngineError::invalid_transition(
                        &run.id,
                        run.status,
                        &[RunStatus::AwaitingApproval],
                    ));
                }
                run.config.merge_approval(approved_steps);
                run.output.scratch.approval_granted = Some(true);
                run.output.scratch.approved_at = Some(approved_at);
                run.status = RunStatus::Approved;
                Ok(())
            },
            options,
            caller,
        )
        .await
    }

    /// Record a generated plan. Steps are created only on the first plan.
    #[instrument(skip(self, plan, diff), fields(steps = plan.len()))]
    pub async fn persist_plan(&self, run_id: &str, plan: Vec<PlanStep>, diff: Option<Value>) -> Result<Run> {
        let steps: Vec<Step> = plan.iter().map(|p| Step::from_plan(run_id, p)).collect();
        let update = self
            .update(run_id, move |run| {
                run.output.merge_plan(&plan, diff);
                run.plan = plan;
                Ok(())
            })
            .await?;

        if self.store.create_steps_if_absent(run_id, steps).await? {
            tracing::debug!("steps created from plan");
        }
        self.announce(&update.after, EventType::PlanGenerated).await;
        Ok(update.after)
    }

    /// Gate a run on user input.
    pub async fn await_input(&self, run_id: &str, questions: Vec<PendingQuestion>) -> Result<Run> {
        let update = self
            .update(run_id, move |run| {
                ensure_not_terminal(run)?;
                run.output.awaiting.get_or_insert_default().questions = questions;
                run.status = RunStatus::AwaitingInput;
                Ok(())
            })
            .await?;
        self.announce_status(&update.after).await;
        Ok(update.after)
    }

    /// Merge answers into the run and mark it `PENDING`.
    pub async fn store_answers(&self, run_id: &str, answers: Map<String, Value>) -> Result<Run> {
        let update = self
            .update(run_id, move |run| {
                ensure_not_terminal(run)?;
                run.answers.extend(answers);
                run.status = RunStatus::Pending;
                Ok(())
            })
            .await?;
        self.announce_status(&update.after).await;
        Ok(update.after)
    }

    /// Record answers without resuming. See [`record_answers`].
    pub async fn apply_user_answers(&self, run_id: &str, answers: Map<String, Value>) -> Result<Run> {
        let update = self
            .update(run_id, move |run| {
                record_answers(run, &answers);
                Ok(())
            })
            .await?;
        Ok(update.after)
    }

    /// Keep the run waiting and record why its answers were rejected.
    pub async fn persist_validation_errors(
        &self,
        run_id: &str,
        errors: BTreeMap<String, String>,
    ) -> Result<Run> {
        let update = self
            .update(run_id, move |run| {
                run.output.merge_validation_errors(&errors);
                run.output.audit.record_rejection(errors);
                Ok(())
            })
            .await?;
        self.announce(&update.after, EventType::RunStatus).await;
        Ok(update.after)
    }

    /// Validate, record and resume. Rejected answers leave the run waiting
    /// and return `Validation`. Recording shares the `PENDING` update, so a
    /// failed dispatch leaves the questions pending.
    #[instrument(skip(self, answers, caller))]
    pub async fn answer_questions(
        &self,
        run_id: &str,
        answers: Map<String, Value>,
        caller: &CallerContext,
    ) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        ensure_not_terminal(&run)?;

        let errors = validate_answers(&run, &answers);
        if !errors.is_empty() {
            self.persist_validation_errors(run_id, errors.clone()).await?;
            return Err(EngineError::Validation(errors));
        }

        self.resume_executor(run_id, Some(answers), caller).await
    }

    /// Rebuild step contexts from the plan and executed steps, then resume
    /// the executor.
    pub async fn execute_plan_with_answers(&self, run_id: &str, caller: &CallerContext) -> Result<Run> {
        self.resume_executor(run_id, None, caller).await
    }

    async fn resume_executor(
        &self,
        run_id: &str,
        submitted: Option<Map<String, Value>>,
        caller: &CallerContext,
    ) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        ensure_not_terminal(&run)?;
        let answers = submitted.clone().unwrap_or_default();

        let contexts = self.step_contexts(&run).await?;
        let tz = self
            .store
            .get_user(run.user_id)
            .await?
            .and_then(|user| user.timezone)
            .filter(|tz| !tz.is_empty())
            .unwrap_or_else(|| "UTC".to_string());

        let mut scratch = run.output.scratch.clone();
        scratch.merge_answers(&answers);
        let mut merged_answers = scratch.answers;
        merged_answers.extend(answers.clone());
        let options = DispatchOptions {
            delay_ms: 0,
            scratch: Some(json!({
                "resume": {
                    "from": ResumeFrom::Executor,
                    "tz": tz,
                    "steps": contexts,
                    "answers": merged_answers,
                }
            })),
        };

        self.transition_and_dispatch(
            run_id,
            move |run| {
                ensure_not_terminal(run)?;
                if let Some(submitted) = &submitted {
                    record_answers(run, submitted);
                }
                run.answers.extend(answers);
                run.status = RunStatus::Pending;
                run.config.resume_from = Some(ResumeFrom::Executor);
                Ok(())
            },
            options,
            caller,
        )
        .await
    }

    /// Join plan steps to executed steps by plan-step id, then by step id.
    async fn step_contexts(&self, run: &Run) -> Result<Vec<StepExecutionContext>> {
        let steps = self.store.list_steps(&run.id).await?;
        let mut contexts = Vec::with_capacity(run.plan.len());

        for plan_step in &run.plan {
            let step = steps
                .iter()
                .find(|s| s.plan_step_id.as_deref() == Some(plan_step.id.as_str()))
                .or_else(|| steps.iter().find(|s| s.id == plan_step.id));

            let credential_id = step
                .and_then(|s| s.credential_id.clone())
                .or_else(|| plan_step.credential_id.clone());
            let credential = match credential_id {
                Some(id) => self
                    .store
                    .get_credential(&id)
                    .await?
                    .map(|c| CredentialSnapshot::from(&c)),
                None => None,
            };

            contexts.push(StepExecutionContext {
                plan_step_id: plan_step.id.clone(),
                step_id: step.map(|s| s.id.clone()),
                tool: plan_step.tool.clone(),
                args: plan_step.args.clone(),
                app_id: plan_step.app_id.clone().or_else(|| step.and_then(|s| s.app_id.clone())),
                credential,
            });
        }
        Ok(contexts)
    }

    /// Guarded status change with no dispatch. Terminal runs are frozen.
    #[instrument(skip(self, reason))]
    pub async fn transition(&self, run_id: &str, to: RunStatus, reason: Option<String>) -> Result<Run> {
        let update = self
            .update(run_id, move |run| {
                if !run.status.can_transition_to(to) {
                    return Err(EngineError::BadRequest(format!(
                        "run `{}` is {} and can no longer change",
                        run.id, run.status
                    )));
                }
                run.status = to;
                if let Some(reason) = reason {
                    run.output.scratch.failure_reason = Some(reason);
                }
                Ok(())
            })
            .await?;
        tracing::info!(from = %update.before.status, to = %to, "run transitioned");
        self.announce_status(&update.after).await;
        Ok(update.after)
    }

    /// Status change that only applies while the run is in one of `from`.
    pub async fn transition_from(&self, run_id: &str, from: &[RunStatus], to: RunStatus) -> Result<Run> {
        let from = from.to_vec();
        let update = self
            .update(run_id, move |run| {
                if !from.contains(&run.status) {
                    return Err(EngineError::invalid_transition(&run.id, run.status, &from));
                }
                run.status = to;
                Ok(())
            })
            .await?;
        self.announce_status(&update.after).await;
        Ok(update.after)
    }

    pub async fn cancel(&self, run_id: &str) -> Result<Run> {
        self.transition(run_id, RunStatus::Canceled, None).await
    }

    pub async fn report_step(&self, run_id: &str, step_id: &str, report: StepReport) -> Result<Step> {
        let mut step = self
            .store
            .get_step(run_id, step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("step `{step_id}` not found")))?;
        step.status = report.status;
        if report.response.is_some() {
            step.response = report.response;
        }
        self.store.update_step(&step).await?;

        let event = match step.status {
            StepStatus::Pending => None,
            StepStatus::Running => Some(EventType::StepStarted),
            StepStatus::Succeeded => Some(EventType::StepSucceeded),
            StepStatus::Failed => Some(EventType::StepFailed),
        };
        if let Some(event) = event {
            let payload = StepEventPayload {
                step: step.clone(),
                error: report.error,
            };
            let payload = serde_json::to_value(&payload).unwrap_or_default();
            self.bus.publish(run_id, event.channel(), event, payload).await;
        }
        Ok(step)
    }

    async fn announce(&self, run: &Run, event: EventType) {
        let steps = match self.store.list_steps(&run.id).await {
            Ok(steps) => steps,
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "could not load steps for event");
                Vec::new()
            }
        };
        let payload = RunSnapshotPayload {
            status: run.status,
            steps,
            questions: run.pending_questions().to_vec(),
            output: run.output.clone(),
        };
        let payload = serde_json::to_value(&payload).unwrap_or_default();
        self.bus.publish(&run.id, event.channel(), event, payload).await;
    }

    async fn announce_status(&self, run: &Run) {
        self.announce(run, EventType::RunStatus).await;
        if run.status.is_terminal() {
            self.announce(run, EventType::RunCompleted).await;
        }
        self.project_chat_item(run).await;
    }

    /// Best-effort chat-history projection.
    async fn project_chat_item(&self, run: &Run) {
        let item = ChatItem {
            run_id: run.id.clone(),
            user_id: run.user_id,
            title: chat_title(&run.prompt),
            status: run.status,
            updated_at: run.updated_at,
        };
        if let Err(e) = self.store.upsert_chat_item(&item).await {
            tracing::warn!(run_id = %run.id, error = %e, "chat item projection failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::domain::events::STATUS_CHANNEL;
    use crate::engine::domain::identity::Credential;
    use crate::engine::runtime::testing::{FailingQueue, Fixture};
    use tokio::sync::mpsc;

    fn plan() -> Vec<PlanStep> {
        vec![
            PlanStep {
                id: "s1".into(),
                tool: "calendar.create".into(),
                args: json!({ "title": "sync" }),
                app_id: Some("gcal".into()),
                credential_id: None,
            },
            PlanStep {
                id: "s2".into(),
                tool: "email.send".into(),
                args: json!({ "to": "team@example.com" }),
                app_id: None,
                credential_id: None,
            },
        ]
    }

    fn new_run(mode: RunMode) -> NewRun {
        NewRun {
            prompt: "schedule a sync".into(),
            mode,
            ..NewRun::default()
        }
    }

    #[tokio::test]
    async fn test_initial_status_by_mode() {
        let fx = Fixture::new().await;
        for (mode, status) in [
            (RunMode::Preview, RunStatus::Planning),
            (RunMode::Approval, RunStatus::AwaitingApproval),
            (RunMode::Scheduled, RunStatus::Scheduled),
            (RunMode::Auto, RunStatus::Queued),
        ] {
            let run = fx.machine.create_run(new_run(mode), &fx.caller()).await.unwrap();
            assert_eq!(run.status, status, "mode {mode}");
            assert!(run.policy_snapshot.is_some());
        }
        assert_eq!(fx.queue.pending().len(), 4);
    }

    #[tokio::test]
    async fn test_approve_from_wrong_state_does_not_mutate() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Auto), &fx.caller()).await.unwrap();
        let before = fx.machine.get_run(&run.id).await.unwrap();

        let err = fx
            .machine
            .approve_steps(&run.id, vec!["s1".into()], &fx.caller())
            .await
            .unwrap_err();
        match err {
            EngineError::BadRequest(message) => {
                assert!(message.contains("QUEUED"));
                assert!(message.contains("AWAITING_APPROVAL"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let after = fx.machine.get_run(&run.id).await.unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.config, before.config);
        assert_eq!(fx.queue.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_approval_scenario() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Approval), &fx.caller()).await.unwrap();
        fx.machine.persist_plan(&run.id, plan(), None).await.unwrap();

        let approved = fx
            .machine
            .approve_steps(&run.id, vec!["s1".into(), "s2".into()], &fx.caller())
            .await
            .unwrap();
        assert_eq!(approved.status, RunStatus::Approved);
        assert_eq!(approved.output.scratch.approval_granted, Some(true));
        assert!(approved.output.scratch.approved_at.is_some());
        assert_eq!(approved.config.resume_from, Some(ResumeFrom::Executor));
        assert_eq!(
            approved.config.approved_steps,
            Some(vec!["s1".to_string(), "s2".to_string()])
        );

        let jobs = fx.queue.pending();
        let last = jobs.last().unwrap();
        assert_eq!(last.payload["scratch"]["approvalGranted"], json!(true));
        assert!(last.payload["scratch"]["approvedAt"].is_string());
    }

    #[tokio::test]
    async fn test_persist_plan_merges_and_creates_steps_once() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Preview), &fx.caller()).await.unwrap();
        fx.store
            .update_run(
                &run.id,
                Box::new(|run| {
                    run.output.extra.insert("notes".into(), json!("keep me"));
                    Ok(())
                }),
            )
            .await
            .unwrap();

        fx.machine
            .persist_plan(&run.id, plan(), Some(json!({ "calendar": ["+ sync"] })))
            .await
            .unwrap();
        let replanned = fx
            .machine
            .persist_plan(&run.id, plan(), Some(json!({ "email": ["+ note"] })))
            .await
            .unwrap();

        assert_eq!(replanned.output.extra["notes"], "keep me");
        let diff = replanned.output.diff.unwrap();
        assert!(diff.get("calendar").is_some());
        assert!(diff.get("email").is_some());
        assert_eq!(replanned.output.scratch.plan.unwrap().len(), 2);
        assert_eq!(fx.store.list_steps(&run.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_answers_audit_grows_by_two_each_apply() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Auto), &fx.caller()).await.unwrap();
        let answers = json!({ "meeting.title": "Sync", "attendees": 3 });
        let answers = answers.as_object().unwrap().clone();

        let first = fx.machine.apply_user_answers(&run.id, answers.clone()).await.unwrap();
        assert_eq!(first.output.audit.qna.len(), 2);
        assert_eq!(first.output.audit.qna[0].event, AuditEvent::Answered);
        assert_eq!(first.output.audit.qna[1].event, AuditEvent::Validated);
        assert_eq!(first.output.scratch.answers["meeting"]["title"], "Sync");

        let second = fx.machine.apply_user_answers(&run.id, answers).await.unwrap();
        assert_eq!(second.output.audit.qna.len(), 4);
        assert!(second.output.awaiting.is_none());
    }

    #[tokio::test]
    async fn test_validation_errors_keep_run_waiting() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Auto), &fx.caller()).await.unwrap();
        fx.machine
            .await_input(
                &run.id,
                vec![PendingQuestion {
                    key: "title".into(),
                    prompt: "Meeting title?".into(),
                    required: true,
                }],
            )
            .await
            .unwrap();

        let err = fx
            .machine
            .answer_questions(&run.id, Map::new(), &fx.caller())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref e) if e.contains_key("title")));

        let waiting = fx.machine.get_run(&run.id).await.unwrap();
        assert_eq!(waiting.status, RunStatus::AwaitingInput);
        assert_eq!(waiting.output.audit.qna.len(), 1);
        assert_eq!(waiting.output.audit.qna[0].event, AuditEvent::Rejected);
        assert!(waiting.output.awaiting.unwrap().errors.contains_key("title"));

        let answers = json!({ "title": "Weekly" }).as_object().unwrap().clone();
        let resumed = fx.machine.answer_questions(&run.id, answers, &fx.caller()).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Pending);
        assert_eq!(resumed.answers["title"], "Weekly");
        assert!(!resumed.has_pending_questions());
    }

    #[tokio::test]
    async fn test_store_answers_overwrites_and_adds() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Auto), &fx.caller()).await.unwrap();
        let first = json!({ "a": 1, "b": 1 }).as_object().unwrap().clone();
        let second = json!({ "b": 2, "c": 3 }).as_object().unwrap().clone();
        fx.machine.store_answers(&run.id, first).await.unwrap();
        let run = fx.machine.store_answers(&run.id, second).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.answers, *json!({ "a": 1, "b": 2, "c": 3 }).as_object().unwrap());
    }

    #[tokio::test]
    async fn test_execute_plan_joins_steps_and_redacts_credentials() {
        let fx = Fixture::new().await;
        fx.store
            .insert_credential(Credential {
                id: "cred-1".into(),
                user_id: 1,
                app_id: "gcal".into(),
                label: Some("Work calendar".into()),
                scopes: vec!["calendar".into()],
                expires_at: None,
                secret: Some("s3cr3t".into()),
            })
            .await;
        let run = fx.machine.create_run(new_run(RunMode::Preview), &fx.caller()).await.unwrap();
        fx.machine.persist_plan(&run.id, plan(), None).await.unwrap();
        let mut step = fx.store.list_steps(&run.id).await.unwrap().remove(0);
        step.credential_id = Some("cred-1".into());
        fx.store.update_step(&step).await.unwrap();

        let resumed = fx.machine.execute_plan_with_answers(&run.id, &fx.caller()).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Pending);
        assert_eq!(resumed.config.resume_from, Some(ResumeFrom::Executor));

        let job = fx.queue.pending().pop().unwrap();
        let resume = &job.payload["scratch"]["resume"];
        assert_eq!(resume["tz"], "UTC");
        assert_eq!(resume["steps"][0]["stepId"], json!(step.id));
        assert_eq!(resume["steps"][0]["credential"]["label"], "Work calendar");
        assert!(!job.payload.to_string().contains("s3cr3t"));
        assert!(resume["steps"][1]["credential"].is_null());
    }

    #[tokio::test]
    async fn test_terminal_runs_are_frozen() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Auto), &fx.caller()).await.unwrap();
        fx.machine.transition(&run.id, RunStatus::Running, None).await.unwrap();
        fx.machine.transition(&run.id, RunStatus::Succeeded, None).await.unwrap();

        assert!(matches!(
            fx.machine.cancel(&run.id).await,
            Err(EngineError::BadRequest(_))
        ));
        assert!(matches!(
            fx.machine.store_answers(&run.id, Map::new()).await,
            Err(EngineError::BadRequest(_))
        ));
        let item = fx.store.get_chat_item(&run.id).await.unwrap().unwrap();
        assert_eq!(item.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_terminal_transition_publishes_completion() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Auto), &fx.caller()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = fx.bus.subscribe_fn(Some(&run.id), STATUS_CHANNEL, move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event.event_type)?;
                Ok(())
            }
        });
        fx.machine.cancel(&run.id).await.unwrap();

        let seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        assert_eq!(seen, ["run_status", "run_completed"]);
    }

    #[tokio::test]
    async fn test_dispatch_failure_rolls_back_or_fails_run() {
        let fx = Fixture::with_queue(Arc::new(FailingQueue)).await;

        let err = fx
            .machine
            .create_run(new_run(RunMode::Approval), &fx.caller())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Dispatch { .. }));
        let runs = fx.store.list_runs_for_user(1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].output.scratch.failure_reason.is_some());

        let mut gated = Run::new("gated", RunMode::Approval, "p", 1, None);
        gated.config.meta.insert("k".into(), json!("v"));
        fx.store.create_run(&gated).await.unwrap();
        let err = fx
            .machine
            .approve_steps("gated", vec!["s1".into()], &fx.caller())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Dispatch { .. }));

        let restored = fx.machine.get_run("gated").await.unwrap();
        assert_eq!(restored.status, RunStatus::AwaitingApproval);
        assert_eq!(restored.config, gated.config);
        assert!(restored.output.scratch.approval_granted.is_none());

        fx.store.create_run(&Run::new("asking", RunMode::Auto, "p", 1, None)).await.unwrap();
        fx.machine
            .await_input(
                "asking",
                vec![PendingQuestion {
                    key: "title".into(),
                    prompt: "Meeting title?".into(),
                    required: true,
                }],
            )
            .await
            .unwrap();
        let answers = json!({ "title": "Weekly" }).as_object().unwrap().clone();
        let err = fx
            .machine
            .answer_questions("asking", answers, &fx.caller())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Dispatch { .. }));

        let waiting = fx.machine.get_run("asking").await.unwrap();
        assert_eq!(waiting.status, RunStatus::AwaitingInput);
        assert_eq!(waiting.pending_questions().len(), 1);
        assert!(waiting.output.audit.qna.is_empty());
        assert!(waiting.output.scratch.answers.is_empty());
        assert!(waiting.answers.is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_fails_the_run() {
        let fx = Fixture::new().await;
        let request = NewRun {
            delay_ms: u64::MAX,
            ..new_run(RunMode::Auto)
        };
        let err = fx.machine.create_run(request, &fx.caller()).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));

        let runs = fx.store.list_runs_for_user(1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(fx.queue.pending().is_empty());
    }

    #[tokio::test]
    async fn test_report_step_updates_record() {
        let fx = Fixture::new().await;
        let run = fx.machine.create_run(new_run(RunMode::Preview), &fx.caller()).await.unwrap();
        fx.machine.persist_plan(&run.id, plan(), None).await.unwrap();
        let step = fx.store.list_steps(&run.id).await.unwrap().remove(0);

        let updated = fx
            .machine
            .report_step(
                &run.id,
                &step.id,
                StepReport {
                    status: StepStatus::Succeeded,
                    response: Some(json!({ "eventId": "e1" })),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, StepStatus::Succeeded);
        assert_eq!(
            fx.store.get_step(&run.id, &step.id).await.unwrap().unwrap().response,
            Some(json!({ "eventId": "e1" }))
        );

        let missing = fx
            .machine
            .report_step(&run.id, "nope", StepReport { status: StepStatus::Running, response: None, error: None })
            .await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_unknown_mode_defaults_to_auto() {
        let request: NewRun = serde_json::from_value(json!({ "prompt": "p", "mode": "turbo" })).unwrap();
        assert_eq!(request.mode, RunMode::Auto);
        let request: NewRun = serde_json::from_value(json!({ "prompt": "p", "mode": "approval" })).unwrap();
        assert_eq!(request.mode, RunMode::Approval);
    }

    #[test]
    fn test_chat_title_truncates() {
        assert_eq!(chat_title("  "), "Untitled run");
        assert_eq!(chat_title(&"x".repeat(200)).chars().count(), CHAT_TITLE_MAX_CHARS);
    }
}
