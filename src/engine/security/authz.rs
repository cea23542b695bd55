//! Identity resolution, team access and policy/scope derivation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::instrument;

use super::claims::UserClaims;
use super::token::RUNS_EXECUTE_SCOPE;
use crate::engine::domain::{
    identity::{CallerContext, TeamMember, TeamRole, User},
    policy::PolicySnapshot,
    runs::{Run, RunConfig},
};
use crate::engine::persistence::RunStore;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct Authorizer {
    store: Arc<dyn RunStore>,
    auto_enroll_team_members: bool,
}

impl Authorizer {
    pub fn new(store: Arc<dyn RunStore>, auto_enroll_team_members: bool) -> Self {
        Self {
            store,
            auto_enroll_team_members,
        }
    }

    /// Resolve the caller's user record. Never falls back to an anonymous
    /// identity.
    pub async fn resolve_identity(&self, claims: Option<&UserClaims>) -> Result<User> {
        let subject = claims
            .map(|c| c.sub.trim())
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| EngineError::Unauthorized("missing subject claim".into()))?;

        self.store
            .find_user_by_subject(subject)
            .await?
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown user `{subject}`")))
    }

    /// Returns the team the caller acts under, or `None` to proceed team-less.
    ///
    /// A user referencing an existing team without a membership row is
    /// enrolled as `member` when auto-enrollment is on, and refused otherwise.
    #[instrument(skip(self))]
    pub async fn ensure_team_access(&self, team_id: Option<i64>, user_id: i64) -> Result<Option<i64>> {
        let Some(team_id) = team_id else {
            return Ok(None);
        };
        if self.store.get_team(team_id).await?.is_none() {
            tracing::debug!("team does not exist, proceeding without team");
            return Ok(None);
        }
        if self.store.find_team_member(team_id, user_id).await?.is_some() {
            return Ok(Some(team_id));
        }
        if !self.auto_enroll_team_members {
            return Err(EngineError::Forbidden(format!(
                "user {user_id} is not a member of team {team_id}"
            )));
        }

        tracing::info!("auto-enrolling user into team as member");
        self.store
            .create_team_member(&TeamMember {
                team_id,
                user_id,
                role: TeamRole::Member,
            })
            .await?;
        Ok(Some(team_id))
    }

    /// Load a run the caller may act on: its owner or a member of its team.
    pub async fn check_ownership(&self, run_id: &str, caller_sub: &str) -> Result<Run> {
        let caller = self
            .store
            .find_user_by_subject(caller_sub)
            .await?
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown user `{caller_sub}`")))?;

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::run_not_found(run_id))?;

        if run.user_id == caller.id {
            return Ok(run);
        }
        if let Some(team_id) = run.team_id {
            if self.store.find_team_member(team_id, caller.id).await?.is_some() {
                return Ok(run);
            }
        }
        Err(EngineError::Forbidden(format!(
            "user {} may not access run `{run_id}`",
            caller.id
        )))
    }

    /// Team base allowlist unioned with the run's own allowlist.
    pub async fn build_policy_snapshot(
        &self,
        team_id: Option<i64>,
        run_tool_allowlist: &[String],
    ) -> Result<PolicySnapshot> {
        let base = match team_id {
            Some(team_id) => self.store.team_policy(team_id).await?.tool_allowlist,
            None => Vec::new(),
        };
        Ok(PolicySnapshot::merged(&base, run_tool_allowlist))
    }

    /// Scopes a dispatched job may use. Always includes `runs:execute`.
    pub fn derive_scopes(run: &Run, config: &RunConfig, policy: &PolicySnapshot) -> BTreeSet<String> {
        let mut scopes = BTreeSet::from([RUNS_EXECUTE_SCOPE.to_string()]);

        for target in &config.channel_targets {
            if let Some(app_id) = target.app_id.as_deref().filter(|a| !a.is_empty()) {
                scopes.insert(format!("tool:{app_id}"));
            }
            scopes.extend(target.scopes.iter().filter(|s| !s.is_empty()).cloned());
        }

        let tools = run
            .config
            .tool_allowlist
            .iter()
            .chain(&config.tool_allowlist)
            .chain(&policy.allowlist.tools);
        scopes.extend(
            tools
                .filter(|tool| !tool.is_empty())
                .map(|tool| format!("tool:{tool}")),
        );
        scopes
    }

    /// Build the explicit caller context threaded through engine calls.
    pub async fn caller_context(
        &self,
        claims: Option<&UserClaims>,
        team_id: Option<i64>,
    ) -> Result<CallerContext> {
        let user = self.resolve_identity(claims).await?;
        let team_id = self.ensure_team_access(team_id, user.id).await?;
        Ok(CallerContext::new(&user, team_id))
    }
}
