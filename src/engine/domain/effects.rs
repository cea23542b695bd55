use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reversible side effect caused by a step.
///
/// Tool code creates it at step-success time and flips `can_undo` off once
/// its own validity window has passed. Only the undo ledger sets `undone_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunEffect {
    pub id: String,
    pub run_id: String,
    #[serde(default)]
    pub step_id: Option<String>,
    pub tool: String,
    pub can_undo: bool,
    #[serde(default)]
    pub undone_at: Option<DateTime<Utc>>,
    /// Tool result the compensating `undo` call receives.
    #[serde(default)]
    pub result: Value,
    pub created_at: DateTime<Utc>,
}

impl RunEffect {
    pub fn new(run_id: &str, step_id: Option<String>, tool: &str, result: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            step_id,
            tool: tool.to_string(),
            can_undo: true,
            undone_at: None,
            result,
            created_at: Utc::now(),
        }
    }

    pub fn is_undoable(&self) -> bool {
        self.can_undo && self.undone_at.is_none()
    }
}
