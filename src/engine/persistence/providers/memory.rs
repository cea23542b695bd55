use std::collections::HashMap;
#[cfg(test)]
use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::engine::domain::{
    effects::RunEffect,
    identity::{ChatItem, Credential, Team, TeamMember, User},
    policy::TeamPolicy,
    runs::{Run, Step},
};
use crate::engine::persistence::{RunMutation, RunStore, RunUpdate};
use crate::error::EngineError;

/// Process-local store. Every operation takes one lock, which gives
/// `update_run` its atomic read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    runs: HashMap<String, Run>,
    steps: HashMap<String, Vec<Step>>,
    users: HashMap<i64, User>,
    teams: HashMap<i64, Team>,
    policies: HashMap<i64, TeamPolicy>,
    members: Vec<TeamMember>,
    credentials: HashMap<String, Credential>,
    effects: Vec<RunEffect>,
    chat_items: HashMap<String, ChatItem>,
    #[cfg(test)]
    poisoned_apps: HashSet<String>,
}

impl StoreState {
    #[cfg(test)]
    fn ensure_app_reachable(&self, app_id: &str) -> Result<()> {
        if self.poisoned_apps.contains(app_id) {
            anyhow::bail!("credential backend unavailable for `{app_id}`");
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[allow(clippy::unused_self, clippy::unnecessary_wraps)]
    fn ensure_app_reachable(&self, _app_id: &str) -> Result<()> {
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    pub async fn insert_team(&self, team: Team, policy: TeamPolicy) {
        let mut state = self.state.write().await;
        state.policies.insert(team.id, policy);
        state.teams.insert(team.id, team);
    }

    pub async fn insert_credential(&self, credential: Credential) {
        self.state
            .write()
            .await
            .credentials
            .insert(credential.id.clone(), credential);
    }

    pub async fn effects_for_run(&self, run_id: &str) -> Vec<RunEffect> {
        self.state
            .read()
            .await
            .effects
            .iter()
            .filter(|effect| effect.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Make credential lookups for `app_id` fail.
    #[cfg(test)]
    pub(crate) async fn poison_app(&self, app_id: &str) {
        self.state
            .write()
            .await
            .poisoned_apps
            .insert(app_id.to_string());
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut state = self.state.write().await;
        if state.runs.contains_key(&run.id) {
            anyhow::bail!("run `{}` already exists", run.id);
        }
        state.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        Ok(self.state.read().await.runs.get(id).cloned())
    }

    async fn update_run(&self, id: &str, mutation: RunMutation) -> Result<RunUpdate> {
        let mut state = self.state.write().await;
        let stored = state
            .runs
            .get_mut(id)
            .ok_or_else(|| EngineError::run_not_found(id))?;

        let before = stored.clone();
        let mut after = stored.clone();
        mutation(&mut after)?;
        after.updated_at = Utc::now();
        *stored = after.clone();

        Ok(RunUpdate { before, after })
    }

    async fn list_runs_for_user(&self, user_id: i64) -> Result<Vec<Run>> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|run| run.user_id == user_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>> {
        Ok(self
            .state
            .read()
            .await
            .steps
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_steps_if_absent(&self, run_id: &str, steps: Vec<Step>) -> Result<bool> {
        let mut state = self.state.write().await;
        let existing = state.steps.entry(run_id.to_string()).or_default();
        if !existing.is_empty() {
            return Ok(false);
        }
        *existing = steps;
        Ok(true)
    }

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<Step>> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .get(run_id)
            .and_then(|steps| steps.iter().find(|s| s.id == step_id))
            .cloned())
    }

    async fn update_step(&self, step: &Step) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .steps
            .get_mut(&step.run_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.id == step.id))
            .ok_or_else(|| EngineError::NotFound(format!("step `{}` not found", step.id)))?;
        *slot = step.clone();
        Ok(())
    }

    async fn find_user_by_subject(&self, subject: &str) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state.users.values().find(|u| u.subject == subject).cloned())
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn get_team(&self, id: i64) -> Result<Option<Team>> {
        Ok(self.state.read().await.teams.get(&id).cloned())
    }

    async fn team_policy(&self, team_id: i64) -> Result<TeamPolicy> {
        Ok(self
            .state
            .read()
            .await
            .policies
            .get(&team_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_team_member(&self, team_id: i64, user_id: i64) -> Result<Option<TeamMember>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .iter()
            .find(|m| m.team_id == team_id && m.user_id == user_id)
            .cloned())
    }

    async fn create_team_member(&self, member: &TeamMember) -> Result<()> {
        let mut state = self.state.write().await;
        let exists = state
            .members
            .iter()
            .any(|m| m.team_id == member.team_id && m.user_id == member.user_id);
        if !exists {
            state.members.push(member.clone());
        }
        Ok(())
    }

    async fn find_credential_for_app(
        &self,
        user_id: i64,
        app_id: &str,
    ) -> Result<Option<Credential>> {
        let state = self.state.read().await;
        state.ensure_app_reachable(app_id)?;
        Ok(state
            .credentials
            .values()
            .find(|c| c.user_id == user_id && c.app_id == app_id)
            .cloned())
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Credential>> {
        Ok(self.state.read().await.credentials.get(id).cloned())
    }

    async fn create_effect(&self, effect: &RunEffect) -> Result<()> {
        self.state.write().await.effects.push(effect.clone());
        Ok(())
    }

    async fn list_undoable_effects(&self, run_id: &str) -> Result<Vec<RunEffect>> {
        let state = self.state.read().await;
        Ok(state
            .effects
            .iter()
            .filter(|e| e.run_id == run_id && e.is_undoable())
            .cloned()
            .collect())
    }

    async fn mark_effects_undone(
        &self,
        run_id: &str,
        effect_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for effect in state
            .effects
            .iter_mut()
            .filter(|e| e.run_id == run_id && e.is_undoable() && effect_ids.contains(&e.id))
        {
            effect.undone_at = Some(at);
            effect.can_undo = false;
            changed += 1;
        }
        Ok(changed)
    }

    async fn upsert_chat_item(&self, item: &ChatItem) -> Result<()> {
        self.state
            .write()
            .await
            .chat_items
            .insert(item.run_id.clone(), item.clone());
        Ok(())
    }

    async fn get_chat_item(&self, run_id: &str) -> Result<Option<ChatItem>> {
        Ok(self.state.read().await.chat_items.get(run_id).cloned())
    }
}
