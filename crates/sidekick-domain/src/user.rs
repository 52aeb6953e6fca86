//! User-interaction primitives: request kinds, responses, and the
//! out-of-band pending-action payload.

use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// What kind of input a flow is asking the user for. The kind tells the UI
/// which widget to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    FreeForm,
    MultipleChoice,
    Approval,
    MergeApproval,
    Continue,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FreeForm => "free_form",
            Self::MultipleChoice => "multiple_choice",
            Self::Approval => "approval",
            Self::MergeApproval => "merge_approval",
            Self::Continue => "continue",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound signal answering a user-interaction request.
///
/// Routed to the workflow whose id matches `target_workflow_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub target_workflow_id: Id,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,

    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl UserResponse {
    pub fn approval(target: impl Into<Id>, approved: bool) -> Self {
        Self {
            target_workflow_id: target.into(),
            approved: Some(approved),
            ..Default::default()
        }
    }

    pub fn content(target: impl Into<Id>, content: impl Into<String>) -> Self {
        Self {
            target_workflow_id: target.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn choice(target: impl Into<Id>, choice: impl Into<String>) -> Self {
        Self {
            target_workflow_id: target.into(),
            choice: Some(choice.into()),
            ..Default::default()
        }
    }
}

/// An out-of-band user action queued against a flow, e.g. "go to the next
/// step". Queued actions outrank whatever prompt is currently pending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUserAction {
    pub action_type: String,

    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl PendingUserAction {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            params: serde_json::Map::new(),
        }
    }
}
