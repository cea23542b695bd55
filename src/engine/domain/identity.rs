use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::runs::RunStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    /// Subject claim the user authenticates with.
    pub subject: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Stored timezone preference (IANA name).
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Team {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub team_id: i64,
    pub user_id: i64,
    pub role: TeamRole,
}

/// Stored third-party credential. The secret never leaves the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub user_id: i64,
    pub app_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
}

/// Redacted view of a [`Credential`] handed to tool execution contexts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSnapshot {
    pub id: String,
    pub app_id: String,
    pub label: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Credential> for CredentialSnapshot {
    fn from(credential: &Credential) -> Self {
        Self {
            id: credential.id.clone(),
            app_id: credential.app_id.clone(),
            label: credential.label.clone(),
            scopes: credential.scopes.clone(),
            expires_at: credential.expires_at,
        }
    }
}

/// Identity of whoever triggered an operation, passed explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    pub user_sub: String,
    pub user_id: i64,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    pub trace_id: String,
}

impl CallerContext {
    pub fn new(user: &User, team_id: Option<i64>) -> Self {
        Self {
            user_sub: user.subject.clone(),
            user_id: user.id,
            team_id,
            scopes: BTreeSet::new(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

/// Chat-history projection of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatItem {
    pub run_id: String,
    pub user_id: i64,
    pub title: String,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}
