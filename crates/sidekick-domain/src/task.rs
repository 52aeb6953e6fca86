//! Tasks and the kanban lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// Kanban status buckets a task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    ToDo,
    InProgress,
    Blocked,
    InReview,
    Testing,
    Complete,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// All kanban buckets, in board order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::ToDo,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::InReview,
        TaskStatus::Testing,
        TaskStatus::Complete,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToDo => write!(f, "to_do"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Blocked => write!(f, "blocked"),
            Self::InReview => write!(f, "in_review"),
            Self::Testing => write!(f, "testing"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// A unit of work in a workspace.
///
/// Archival is a soft state: an archived task carries its archival timestamp
/// and is a member of no kanban bucket, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Id,
    pub workspace_id: Id,

    pub title: String,
    pub description: String,
    pub status: TaskStatus,

    /// Which agent personality drives flows for this task.
    pub agent_type: String,

    /// Which flow pipeline new flows for this task use.
    pub flow_type: String,

    /// Free-form options forwarded to the flow at start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_options: Option<serde_json::Map<String, serde_json::Value>>,

    /// External references (pull requests, issues, …).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    /// When the task was archived, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_archived(&self) -> bool {
        self.archived.is_some()
    }
}
