//! Bookkeeping for reversible side effects.
//!
//! The ledger does not judge whether an effect is still reversible; tools
//! clear `can_undo` once an effect leaves its validity window.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use crate::engine::domain::effects::RunEffect;
use crate::engine::persistence::RunStore;
use crate::engine::tools::{CompensationReport, ToolContext, ToolRegistry};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UndoReport {
    pub ok: bool,
    pub undone_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationReport>,
}

#[derive(Debug, Clone)]
pub struct UndoLedger {
    store: Arc<dyn RunStore>,
}

impl UndoLedger {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub async fn record_effect(&self, effect: RunEffect) -> Result<RunEffect> {
        self.store.create_effect(&effect).await?;
        tracing::debug!(run_id = %effect.run_id, effect_id = %effect.id, can_undo = effect.can_undo, "effect recorded");
        Ok(effect)
    }

    async fn undoable(&self, run_id: &str) -> Result<Vec<RunEffect>> {
        let effects = self.store.list_undoable_effects(run_id).await?;
        if effects.is_empty() {
            return Err(EngineError::NotFound(format!(
                "run `{run_id}` has no undoable effects"
            )));
        }
        Ok(effects)
    }

    async fn mark(&self, run_id: &str, ids: &[String]) -> Result<usize> {
        let undone = self.store.mark_effects_undone(run_id, ids, Utc::now()).await?;
        metrics::counter!("undo.effects_undone").increment(undone as u64);
        tracing::info!(run_id, undone, "effects marked undone");
        Ok(undone)
    }

    /// Mark every undoable effect of the run undone in one batch.
    #[instrument(skip(self))]
    pub async fn undo_run(&self, run_id: &str) -> Result<UndoReport> {
        let effects = self.undoable(run_id).await?;
        let ids: Vec<String> = effects.into_iter().map(|e| e.id).collect();
        let undone_count = self.mark(run_id, &ids).await?;
        Ok(UndoReport {
            ok: true,
            undone_count,
            compensation: None,
        })
    }

    /// Let reversible tools compensate first, then mark undone everything
    /// whose compensation did not fail.
    #[instrument(skip(self, tools, ctx))]
    pub async fn compensate_and_undo(
        &self,
        run_id: &str,
        tools: &ToolRegistry,
        ctx: &ToolContext,
    ) -> Result<UndoReport> {
        let effects = self.undoable(run_id).await?;
        let compensation = tools.compensate(&effects, ctx).await;
        let settled = compensation.settled();
        let undone_count = if settled.is_empty() {
            0
        } else {
            self.mark(run_id, &settled).await?
        };
        Ok(UndoReport {
            ok: compensation.failed.is_empty(),
            undone_count,
            compensation: Some(compensation),
        })
    }
}
