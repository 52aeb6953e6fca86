//! Subflows: named nested scopes inside a flow.

use serde::{Deserialize, Serialize};

use crate::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubflowStatus {
    Started,
    InProgress,
    Complete,
    Failed,
    Canceled,
}

impl SubflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for SubflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// A named scope within a flow, e.g. "edit code" or "run tests".
///
/// Subflows nest: `parent_subflow_id` points at the enclosing subflow, or is
/// absent for scopes anchored directly at the flow. Nested subflows form a
/// tree reachable from the flow by id only; no back-pointers are held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subflow {
    pub id: Id,
    pub workspace_id: Id,
    pub flow_id: Id,

    pub name: String,

    /// Optional machine-readable scope kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow_type: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    pub status: SubflowStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_subflow_id: Option<Id>,

    /// Terminal payload: JSON-encoded result, an error message, or a
    /// `"canceled:"`-prefixed note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}
