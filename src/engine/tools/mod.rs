//! Tool seam used by workers and by undo compensation.
//!
//! Tool business logic lives outside the engine. What the engine owns is the
//! contract: a tool call is authorized by the job token's scopes, and a
//! reversible tool knows how to compensate one of its own effects.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::domain::effects::RunEffect;
use crate::engine::security::token::JobTokenClaims;
use crate::error::{EngineError, Result};

/// Per-call execution context, derived from a verified job token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolContext {
    pub run_id: String,
    pub user_id: i64,
    pub team_id: Option<i64>,
    pub scopes: BTreeSet<String>,
    pub trace_id: String,
    pub tz: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl From<&JobTokenClaims> for ToolContext {
    fn from(claims: &JobTokenClaims) -> Self {
        Self {
            run_id: claims.run_id.clone(),
            user_id: claims.user_id,
            team_id: claims.team_id,
            scopes: claims.scopes.clone(),
            trace_id: claims.trace_id.clone(),
            tz: claims.tz.clone(),
            meta: claims.meta.clone(),
        }
    }
}

impl ToolContext {
    pub fn may_call(&self, tool: &str) -> bool {
        self.scopes.contains(&format!("tool:{tool}"))
    }
}

#[async_trait]
pub trait Tool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<Value>;

    /// Whether effects of this tool can be compensated.
    fn reversible(&self) -> bool {
        false
    }

    /// Compensate one effect, given the result its call produced.
    async fn undo(&self, result: &Value, _ctx: &ToolContext) -> anyhow::Result<()> {
        let _ = result;
        anyhow::bail!("tool `{}` is not reversible", self.name())
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompensationReport {
    pub compensated: Vec<String>,
    /// No registered tool, or the tool is not reversible.
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl CompensationReport {
    /// Effects that may be marked undone: everything except failures.
    pub fn settled(&self) -> Vec<String> {
        self.compensated
            .iter()
            .chain(&self.skipped)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        tracing::debug!(tool = tool.name(), "tool registered");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a tool, refusing names the context's scopes do not cover.
    pub async fn call(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value> {
        if !ctx.may_call(name) {
            return Err(EngineError::Forbidden(format!(
                "run `{}` is not scoped for tool `{name}`",
                ctx.run_id
            )));
        }
        let tool = self
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("tool `{name}` not registered")))?;
        tool.call(args, ctx).await.map_err(EngineError::Internal)
    }

    /// Best-effort compensation, newest effect first.
    pub async fn compensate(&self, effects: &[RunEffect], ctx: &ToolContext) -> CompensationReport {
        let mut report = CompensationReport::default();
        for effect in effects.iter().rev() {
            let Some(tool) = self.get(&effect.tool).filter(|t| t.reversible()) else {
                report.skipped.push(effect.id.clone());
                continue;
            };
            match tool.undo(&effect.result, ctx).await {
                Ok(()) => report.compensated.push(effect.id.clone()),
                Err(e) => {
                    tracing::warn!(effect_id = %effect.id, tool = %effect.tool, error = %e, "compensation failed");
                    report.failed.push(effect.id.clone());
                }
            }
        }
        report
    }
}
