use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::policy::PolicySnapshot;

/// Current layout of [`RunOutput`]. Bumped when a sub-document changes shape.
pub const OUTPUT_SCHEMA_VERSION: u32 = 1;

/// The unit of work: one end-to-end execution of a user intent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub prompt: String,
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub policy_snapshot: Option<PolicySnapshot>,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub answers: Map<String, Value>,
    #[serde(default)]
    pub output: RunOutput,
    pub user_id: i64,
    #[serde(default)]
    pub team_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Build a fresh run in the initial status for its mode.
    pub fn new(
        id: impl Into<String>,
        mode: RunMode,
        prompt: impl Into<String>,
        user_id: i64,
        team_id: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: RunStatus::initial_for_mode(mode),
            mode,
            prompt: prompt.into(),
            messages: Vec::new(),
            config: RunConfig::default(),
            policy_snapshot: None,
            plan: Vec::new(),
            answers: Map::new(),
            output: RunOutput::default(),
            user_id,
            team_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Questions the run is still waiting on.
    pub fn pending_questions(&self) -> &[PendingQuestion] {
        self.output
            .awaiting
            .as_ref()
            .map_or(&[], |awaiting| awaiting.questions.as_slice())
    }

    pub fn has_pending_questions(&self) -> bool {
        !self.pending_questions().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Scheduled,
    Planning,
    AwaitingApproval,
    Approved,
    AwaitingInput,
    PendingAppsInstall,
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    UndoPending,
    Undone,
    UndoFailed,
}

impl RunStatus {
    /// Status a run starts in, by mode.
    pub fn initial_for_mode(mode: RunMode) -> Self {
        match mode {
            RunMode::Preview => Self::Planning,
            RunMode::Approval => Self::AwaitingApproval,
            RunMode::Scheduled => Self::Scheduled,
            RunMode::Auto => Self::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Undone | Self::UndoFailed
        )
    }

    /// Terminal statuses are frozen; everything else may move anywhere.
    pub fn can_transition_to(self, _next: Self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Scheduled => "SCHEDULED",
            Self::Planning => "PLANNING",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::AwaitingInput => "AWAITING_INPUT",
            Self::PendingAppsInstall => "PENDING_APPS_INSTALL",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::UndoPending => "UNDO_PENDING",
            Self::Undone => "UNDONE",
            Self::UndoFailed => "UNDO_FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Preview,
    Approval,
    #[default]
    Auto,
    Scheduled,
}

impl RunMode {
    /// Unknown or missing modes fall back to `auto`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("preview") => Self::Preview,
            Some("approval") => Self::Approval,
            Some("scheduled") => Self::Scheduled,
            _ => Self::Auto,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Approval => "approval",
            Self::Auto => "auto",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Phase the worker continues from once a gate resolves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResumeFrom {
    Planner,
    Executor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTarget {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunInput {
    #[serde(default)]
    pub prompt: Option<String>,
    /// Kept loose: only forwarded when it is an array.
    #[serde(default)]
    pub messages: Option<Value>,
}

/// Run configuration. Known keys are typed; anything else rides in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<ResumeFrom>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channel_targets: Vec<ChannelTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_allowlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<RunInput>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunConfig {
    /// Record an approval; every other key is left alone.
    pub fn merge_approval(&mut self, approved_steps: Vec<String>) {
        self.approved_steps = Some(approved_steps);
        self.resume_from = Some(ResumeFrom::Executor);
    }
}

/// One proposed tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// The executed record for a plan step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub run_id: String,
    #[serde(default)]
    pub plan_step_id: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub status: StepStatus,
}

impl Step {
    pub fn from_plan(run_id: &str, plan_step: &PlanStep) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            plan_step_id: Some(plan_step.id.clone()),
            tool: plan_step.tool.clone(),
            app_id: plan_step.app_id.clone(),
            credential_id: plan_step.credential_id.clone(),
            request: plan_step.args.clone(),
            response: None,
            status: StepStatus::Pending,
        }
    }

    /// An app is required but no credential has been bound yet.
    pub fn missing_credential(&self) -> bool {
        self.app_id.is_some() && self.credential_id.is_none()
    }
}

/// Structured run output. Each sub-document has its own merge function so
/// writers never replace fields they do not own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    #[serde(default = "output_schema_version")]
    pub version: u32,
    #[serde(default)]
    pub scratch: Scratch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<Value>,
    #[serde(default)]
    pub audit: Audit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<Awaiting>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn output_schema_version() -> u32 {
    OUTPUT_SCHEMA_VERSION
}

impl Default for RunOutput {
    fn default() -> Self {
        Self {
            version: OUTPUT_SCHEMA_VERSION,
            scratch: Scratch::default(),
            diff: None,
            audit: Audit::default(),
            awaiting: None,
            extra: Map::new(),
        }
    }
}

impl RunOutput {
    /// Record a generated plan and merge its diff into any existing diff.
    pub fn merge_plan(&mut self, plan: &[PlanStep], diff: Option<Value>) {
        self.scratch.plan = Some(plan.to_vec());
        if let Some(diff) = diff {
            self.diff = Some(match (self.diff.take(), diff) {
                (Some(Value::Object(mut existing)), Value::Object(incoming)) => {
                    existing.extend(incoming);
                    Value::Object(existing)
                }
                (_, incoming) => incoming,
            });
        }
    }

    /// Store validation errors without touching pending questions.
    pub fn merge_validation_errors(&mut self, errors: &BTreeMap<String, String>) {
        let awaiting = self.awaiting.get_or_insert_with(Awaiting::default);
        awaiting.errors.extend(errors.clone());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Scratch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<PlanStep>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub answers: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_granted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Scratch {
    /// Merge answers. Dotted keys (`"a.b.c"`) write into nested maps,
    /// replacing any non-map value along the way.
    pub fn merge_answers(&mut self, answers: &Map<String, Value>) {
        for (key, value) in answers {
            if key.contains('.') {
                set_dotted(&mut self.answers, key, value.clone());
            } else {
                self.answers.insert(key.clone(), value.clone());
            }
        }
    }
}

fn set_dotted(target: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut cursor = target;
    for segment in parents {
        let next = cursor
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        match next {
            Value::Object(map) => cursor = map,
            _ => return,
        }
    }
    cursor.insert((*last).to_string(), value);
}

/// Append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    #[serde(default)]
    pub qna: Vec<AuditEntry>,
}

impl Audit {
    pub fn record(&mut self, event: AuditEvent, keys: Vec<String>) {
        self.qna.push(AuditEntry {
            event,
            at: Utc::now(),
            keys,
            errors: None,
        });
    }

    pub fn record_rejection(&mut self, errors: BTreeMap<String, String>) {
        self.qna.push(AuditEntry {
            event: AuditEvent::Rejected,
            at: Utc::now(),
            keys: errors.keys().cloned().collect(),
            errors: Some(errors),
        });
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditEvent {
    Answered,
    Validated,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub event: AuditEvent,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, String>>,
}

/// What a gated run is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Awaiting {
    #[serde(default)]
    pub questions: Vec<PendingQuestion>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub key: String,
    pub prompt: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}
