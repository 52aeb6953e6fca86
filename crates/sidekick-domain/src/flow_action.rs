//! Flow actions: the atomic tracked unit of flow work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Started,
    Complete,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Started => write!(f, "started"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One tracked unit of work inside a flow: an activity call or a human prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowAction {
    pub id: Id,
    pub workspace_id: Id,
    pub flow_id: Id,

    /// Enclosing subflow, if the action ran inside one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow_id: Option<Id>,

    /// Legacy concatenated scope path (`:|:`-separated ancestor names),
    /// populated for UI versions that predate the subflow model.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subflow_name: String,

    pub action_type: String,

    #[serde(default)]
    pub action_params: serde_json::Map<String, serde_json::Value>,

    pub status: ActionStatus,

    /// Terminal payload: JSON-encoded return value or an error message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,

    pub is_human_action: bool,
    pub is_callback_action: bool,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl FlowAction {
    /// Whether the required identifiers are populated.
    pub fn has_required_ids(&self) -> bool {
        !self.id.is_empty() && !self.workspace_id.is_empty() && !self.flow_id.is_empty()
    }
}

/// Record published on the per-flow action-changes stream on every upsert.
///
/// Carries the full action, except `actionParams` travels as a
/// string-serialized JSON sub-document: params are arbitrarily nested and the
/// transport may not represent maps natively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowActionChange {
    pub id: Id,
    pub workspace_id: Id,
    pub flow_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow_id: Option<Id>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subflow_name: String,
    pub action_type: String,
    pub action_params: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    pub is_human_action: bool,
    pub is_callback_action: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl From<&FlowAction> for FlowActionChange {
    fn from(action: &FlowAction) -> Self {
        let action_params = serde_json::to_string(&action.action_params)
            .unwrap_or_else(|_| "{}".to_string());
        Self {
            id: action.id.clone(),
            workspace_id: action.workspace_id.clone(),
            flow_id: action.flow_id.clone(),
            subflow_id: action.subflow_id.clone(),
            subflow_name: action.subflow_name.clone(),
            action_type: action.action_type.clone(),
            action_params,
            status: action.status,
            result: action.result.clone(),
            is_human_action: action.is_human_action,
            is_callback_action: action.is_callback_action,
            created: action.created,
            updated: action.updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::prefixes;
    use serde_json::json;

    fn action() -> FlowAction {
        let mut params = serde_json::Map::new();
        params.insert("prompt".to_string(), json!({"text": "hello"}));

        FlowAction {
            id: Id::generate(prefixes::FLOW_ACTION),
            workspace_id: Id::generate(prefixes::WORKSPACE),
            flow_id: Id::generate(prefixes::FLOW),
            subflow_id: None,
            subflow_name: String::new(),
            action_type: "generate_plan".to_string(),
            action_params: params,
            status: ActionStatus::Started,
            result: String::new(),
            is_human_action: false,
            is_callback_action: false,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn test_round_trip() {
        let fa = action();
        let json = serde_json::to_string(&fa).unwrap();
        let parsed: FlowAction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, fa);
    }

    #[test]
    fn test_change_record_stringifies_params() {
        let fa = action();
        let change = FlowActionChange::from(&fa);

        let reparsed: serde_json::Value = serde_json::from_str(&change.action_params).unwrap();
        assert_eq!(reparsed["prompt"]["text"], "hello");

        let wire = serde_json::to_value(&change).unwrap();
        assert!(wire["actionParams"].is_string());
    }

    #[test]
    fn test_required_ids() {
        let mut fa = action();
        assert!(fa.has_required_ids());

        fa.flow_id = Id::default();
        assert!(!fa.has_required_ids());
    }
}
