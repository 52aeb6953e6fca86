//! Flows: one execution of an agentic pipeline, 1:1 with a runtime execution.

use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// Status of a flow. `Running` is the implicit initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Running,
    Paused,
    Failed,
    Complete,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Complete)
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Failed => write!(f, "failed"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// One end-to-end execution of a pipeline for a task (or another parent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: Id,
    pub workspace_id: Id,

    /// Pipeline kind, e.g. `basic_dev` or `planned_dev`.
    pub flow_type: String,

    /// The entity this flow runs for — usually a task id.
    pub parent_id: Id,

    pub status: FlowStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::prefixes;

    #[test]
    fn test_flow_serialization() {
        let flow = Flow {
            id: Id::generate(prefixes::FLOW),
            workspace_id: Id::generate(prefixes::WORKSPACE),
            flow_type: "basic_dev".to_string(),
            parent_id: Id::generate(prefixes::TASK),
            status: FlowStatus::Running,
        };

        let json = serde_json::to_value(&flow).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["flowType"], "basic_dev");

        let parsed: Flow = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, flow);
    }

    #[test]
    fn test_paused_is_not_terminal() {
        assert!(!FlowStatus::Paused.is_terminal());
        assert!(FlowStatus::Complete.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
    }
}
