use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::runs::{PendingQuestion, RunOutput, RunStatus, Step};

/// Channel carrying run lifecycle events.
pub const STATUS_CHANNEL: &str = "status";
/// Channel carrying step lifecycle events.
pub const STEPS_CHANNEL: &str = "steps";

/// Pub/sub envelope. A fresh one is built on every publish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub id: String,
    pub origin: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: String,
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(
        origin: &str,
        event_type: impl Into<String>,
        run_id: &str,
        channel: &str,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin: origin.to_string(),
            event_type: event_type.into(),
            run_id: run_id.to_string(),
            channel: channel.to_string(),
            payload,
            ts: Utc::now(),
        }
    }

    /// Parse a transport envelope. Returns `None` when `id`, `type` or
    /// `runId` is missing or empty, or the rest does not fit the envelope.
    pub fn from_envelope(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        for required in ["id", "type", "runId"] {
            let present = value
                .get(required)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty());
            if !present {
                return None;
            }
        }
        serde_json::from_value(value).ok()
    }
}

/// Client-facing event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    PlanGenerated,
    RunStatus,
    RunCompleted,
    StepStarted,
    StepSucceeded,
    StepFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanGenerated => "plan_generated",
            Self::RunStatus => "run_status",
            Self::RunCompleted => "run_completed",
            Self::StepStarted => "step_started",
            Self::StepSucceeded => "step_succeeded",
            Self::StepFailed => "step_failed",
        }
    }

    pub fn channel(self) -> &'static str {
        match self {
            Self::StepStarted | Self::StepSucceeded | Self::StepFailed => STEPS_CHANNEL,
            _ => STATUS_CHANNEL,
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

/// Enough state for a client to render plan/diff/approve/undo views.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshotPayload {
    pub status: RunStatus,
    pub steps: Vec<Step>,
    pub questions: Vec<PendingQuestion>,
    pub output: RunOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepEventPayload {
    pub step: Step,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
