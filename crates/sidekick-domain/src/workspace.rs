//! Workspaces and their configuration documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// How per-task configuration is resolved for a workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMode {
    /// Use the repository-local config file only.
    #[default]
    Local,

    /// Use the workspace-level config only.
    Workspace,

    /// Merge both, workspace values winning.
    Merge,
}

impl std::fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Workspace => write!(f, "workspace"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// The top-level organizational unit, bound to a local repository checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: Id,
    pub name: String,

    /// Absolute path of the repository this workspace operates on.
    pub local_repo_dir: String,

    pub config_mode: ConfigMode,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Workspace-scoped settings document, stored whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    pub workspace_id: Id,

    /// Arbitrary settings payload (model defaults, command allowances, …).
    pub settings: serde_json::Value,

    pub updated: DateTime<Utc>,
}
