use crate::engine::domain::{
    effects::RunEffect,
    identity::{ChatItem, Credential, Team, TeamMember, User},
    policy::TeamPolicy,
    runs::{Run, Step},
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod providers;

/// Read-modify-write applied to a run under the store's lock.
pub type RunMutation = Box<dyn FnOnce(&mut Run) -> Result<()> + Send>;

/// Both sides of an atomic run update.
#[derive(Debug, Clone)]
pub struct RunUpdate {
    pub before: Run,
    pub after: Run,
}

#[async_trait]
pub trait RunStore: Send + Sync + std::fmt::Debug {
    // =========================================================================
    // Runs
    // =========================================================================

    async fn create_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// Apply `mutation` atomically. Fails with `NotFound` when the run is
    /// absent; a failing mutation leaves the stored run untouched.
    async fn update_run(&self, id: &str, mutation: RunMutation) -> Result<RunUpdate>;

    async fn list_runs_for_user(&self, user_id: i64) -> Result<Vec<Run>>;

    // =========================================================================
    // Steps
    // =========================================================================

    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>>;

    /// Insert steps only if the run has none yet. Returns whether they were
    /// written.
    async fn create_steps_if_absent(&self, run_id: &str, steps: Vec<Step>) -> Result<bool>;

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<Step>>;
    async fn update_step(&self, step: &Step) -> Result<()>;

    // =========================================================================
    // Users & Teams
    // =========================================================================

    async fn find_user_by_subject(&self, subject: &str) -> Result<Option<User>>;
    async fn get_user(&self, id: i64) -> Result<Option<User>>;
    async fn get_team(&self, id: i64) -> Result<Option<Team>>;

    /// Base policy of a team; empty when none is stored.
    async fn team_policy(&self, team_id: i64) -> Result<TeamPolicy>;

    async fn find_team_member(&self, team_id: i64, user_id: i64) -> Result<Option<TeamMember>>;
    async fn create_team_member(&self, member: &TeamMember) -> Result<()>;

    // =========================================================================
    // Credentials
    // =========================================================================

    async fn find_credential_for_app(&self, user_id: i64, app_id: &str)
    -> Result<Option<Credential>>;
    async fn get_credential(&self, id: &str) -> Result<Option<Credential>>;

    // =========================================================================
    // Effects
    // =========================================================================

    async fn create_effect(&self, effect: &RunEffect) -> Result<()>;

    /// Effects with `can_undo = true` and no `undone_at`.
    async fn list_undoable_effects(&self, run_id: &str) -> Result<Vec<RunEffect>>;

    /// Bulk-mark effects undone and flip `can_undo` off. Returns the number
    /// of rows changed.
    async fn mark_effects_undone(
        &self,
        run_id: &str,
        effect_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<usize>;

    // =========================================================================
    // Chat Items
    // =========================================================================

    async fn upsert_chat_item(&self, item: &ChatItem) -> Result<()>;
    async fn get_chat_item(&self, run_id: &str) -> Result<Option<ChatItem>>;
}
