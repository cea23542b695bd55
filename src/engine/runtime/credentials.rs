use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use super::state_machine::RunStateMachine;
use crate::engine::domain::identity::CallerContext;
use crate::engine::domain::runs::RunStatus;
use crate::engine::persistence::RunStore;
use crate::error::{EngineError, Result};

/// Outcome of a credential re-resolution pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    /// Step ids that got a credential bound in this pass.
    pub resolved: Vec<String>,
    /// Step ids still waiting on an app install.
    pub missing_cred_steps: Vec<String>,
    pub status: Option<RunStatus>,
    /// The run left `PENDING_APPS_INSTALL` because of this pass.
    pub resumed: bool,
}

#[derive(Debug)]
pub struct CredentialResolver {
    store: Arc<dyn RunStore>,
    machine: Arc<RunStateMachine>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn RunStore>, machine: Arc<RunStateMachine>) -> Self {
        Self { store, machine }
    }

    /// Bind credentials to steps that need an app but have none. A run gated
    /// on app installs with nothing left missing moves on by itself: to
    /// `AWAITING_INPUT` if questions remain, otherwise straight back to the
    /// executor.
    #[instrument(skip(self))]
    pub async fn re_resolve_step_credentials(&self, run_id: &str, user_id: i64) -> Result<ResolutionReport> {
        let mut report = ResolutionReport::default();

        for mut step in self.store.list_steps(run_id).await? {
            if !step.missing_credential() {
                continue;
            }
            let Some(app_id) = step.app_id.clone() else {
                continue;
            };
            match self.store.find_credential_for_app(user_id, &app_id).await {
                Ok(Some(credential)) => {
                    step.credential_id = Some(credential.id);
                    match self.store.update_step(&step).await {
                        Ok(()) => report.resolved.push(step.id),
                        Err(e) => tracing::warn!(step_id = %step.id, error = %e, "could not bind credential"),
                    }
                }
                Ok(None) => tracing::debug!(step_id = %step.id, app_id = %app_id, "no credential installed yet"),
                Err(e) => tracing::warn!(step_id = %step.id, app_id = %app_id, error = %e, "credential lookup failed"),
            }
        }

        report.missing_cred_steps = self
            .store
            .list_steps(run_id)
            .await?
            .into_iter()
            .filter(|s| s.missing_credential())
            .map(|s| s.id)
            .collect();

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::run_not_found(run_id))?;
        report.status = Some(run.status);

        if run.status != RunStatus::PendingAppsInstall || !report.missing_cred_steps.is_empty() {
            return Ok(report);
        }

        let resumed = if run.has_pending_questions() {
            self.machine
                .transition_from(run_id, &[RunStatus::PendingAppsInstall], RunStatus::AwaitingInput)
                .await?
        } else {
            let owner = self
                .store
                .get_user(run.user_id)
                .await?
                .ok_or_else(|| EngineError::Unauthorized(format!("unknown user {}", run.user_id)))?;
            tracing::info!("all credentials present, resuming run");
            self.machine
                .execute_plan_with_answers(run_id, &CallerContext::new(&owner, run.team_id))
                .await?
        };
        report.status = Some(resumed.status);
        report.resumed = true;
        Ok(report)
    }
}
