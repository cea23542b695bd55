use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Merged tool allowlist attached to a run for a given dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicySnapshot {
    pub allowlist: Allowlist,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Allowlist {
    #[serde(default)]
    pub tools: BTreeSet<String>,
}

impl PolicySnapshot {
    /// Union of a base allowlist and extra tool names, deduplicated.
    pub fn merged<'a, B, E>(base: B, extra: E) -> Self
    where
        B: IntoIterator<Item = &'a String>,
        E: IntoIterator<Item = &'a String>,
    {
        let tools = base
            .into_iter()
            .chain(extra)
            .map(|tool| tool.trim())
            .filter(|tool| !tool.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            allowlist: Allowlist { tools },
        }
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowlist.tools.contains(tool)
    }
}

/// Team-level base policy as stored by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TeamPolicy {
    #[serde(default)]
    pub tool_allowlist: Vec<String>,
}
