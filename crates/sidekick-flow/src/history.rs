//! Run history: the event-sourced record a flow replays from.
//!
//! Every non-deterministic value a flow observes (activity results, side
//! effects, versions, signals, timers) is appended here in order. Re-running
//! the flow function against the recorded history reproduces the exact same
//! path up to the recorded horizon, which is what makes resumption safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use sidekick_domain::{Id, UserResponse};

/// Error type for run-history operations.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("execution not found: {0}")]
    NotFound(Id),

    /// Optimistic append lost the race.
    #[error("sequence conflict: expected {expected}, actual {actual}")]
    SequenceConflict { expected: u64, actual: u64 },

    #[error("history transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HistoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Events in a flow's append-only run history.
///
/// Immutable once written; the replay cursor walks them in sequence order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Execution began with the given input.
    RunStarted { input: serde_json::Value },

    /// An activity finished and produced a result.
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },

    /// An activity exhausted its retries (final failure).
    ActivityFailed {
        activity_id: String,
        error: String,
        attempts: u32,
    },

    /// A recorded non-deterministic value (wall clock, fresh id, …).
    /// Replayed strictly in recording order.
    SideEffect { value: serde_json::Value },

    /// A behavior-version decision taken at a gated branching point.
    VersionMarker { change_id: String, version: u32 },

    /// An inbound user response was consumed.
    SignalReceived { response: UserResponse },

    /// A timer elapsed.
    TimerFired { timer_id: String },

    /// Terminal: completed with a result.
    RunCompleted { result: serde_json::Value },

    /// Terminal: failed.
    RunFailed { error: String },

    /// Terminal: cancelled (or preempted by a pending user action).
    RunCancelled { reason: String },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}

/// Status of one workflow execution as the runtime sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    Terminated,
}

impl RunStatus {
    /// Statuses the failure sweeper reconciles parent tasks for.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Terminated)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// One workflow execution, queryable by workspace for the failure sweeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowExecution {
    pub flow_id: Id,
    pub workspace_id: Id,
    pub parent_id: Id,
    pub flow_type: String,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

/// Store for run histories and the execution registry.
#[async_trait]
pub trait RunHistoryStore: Send + Sync + 'static {
    async fn create_execution(&self, execution: FlowExecution) -> Result<(), HistoryError>;

    async fn get_execution(&self, flow_id: &Id) -> Result<FlowExecution, HistoryError>;

    async fn update_execution_status(
        &self,
        flow_id: &Id,
        status: RunStatus,
    ) -> Result<(), HistoryError>;

    /// Append one event with an optimistic sequence check. Returns the new
    /// sequence (= event count).
    async fn append_event(
        &self,
        flow_id: &Id,
        expected_sequence: u64,
        event: RunEvent,
    ) -> Result<u64, HistoryError>;

    /// Full history in sequence order (for replay).
    async fn load_events(&self, flow_id: &Id) -> Result<Vec<RunEvent>, HistoryError>;

    /// Executions in a workspace whose status is one of `statuses` and which
    /// were last updated at or after `since`.
    async fn list_executions(
        &self,
        workspace_id: &Id,
        statuses: &[RunStatus],
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowExecution>, HistoryError>;
}

struct ExecutionState {
    execution: FlowExecution,
    events: Vec<RunEvent>,
}

/// In-memory implementation of the run-history store.
#[derive(Default)]
pub struct MemoryRunHistory {
    executions: RwLock<HashMap<Id, ExecutionState>>,
}

impl MemoryRunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }
}

#[async_trait]
impl RunHistoryStore for MemoryRunHistory {
    async fn create_execution(&self, execution: FlowExecution) -> Result<(), HistoryError> {
        let mut executions = self.executions.write();
        executions
            .entry(execution.flow_id.clone())
            .or_insert(ExecutionState {
                execution,
                events: vec![],
            });
        Ok(())
    }

    async fn get_execution(&self, flow_id: &Id) -> Result<FlowExecution, HistoryError> {
        self.executions
            .read()
            .get(flow_id)
            .map(|s| s.execution.clone())
            .ok_or_else(|| HistoryError::NotFound(flow_id.clone()))
    }

    async fn update_execution_status(
        &self,
        flow_id: &Id,
        status: RunStatus,
    ) -> Result<(), HistoryError> {
        let mut executions = self.executions.write();
        let state = executions
            .get_mut(flow_id)
            .ok_or_else(|| HistoryError::NotFound(flow_id.clone()))?;
        state.execution.status = status;
        state.execution.updated_at = Utc::now();
        Ok(())
    }

    async fn append_event(
        &self,
        flow_id: &Id,
        expected_sequence: u64,
        event: RunEvent,
    ) -> Result<u64, HistoryError> {
        let mut executions = self.executions.write();
        let state = executions
            .get_mut(flow_id)
            .ok_or_else(|| HistoryError::NotFound(flow_id.clone()))?;

        let actual = state.events.len() as u64;
        if actual != expected_sequence {
            return Err(HistoryError::SequenceConflict {
                expected: expected_sequence,
                actual,
            });
        }

        state.events.push(event);
        state.execution.updated_at = Utc::now();
        Ok(state.events.len() as u64)
    }

    async fn load_events(&self, flow_id: &Id) -> Result<Vec<RunEvent>, HistoryError> {
        self.executions
            .read()
            .get(flow_id)
            .map(|s| s.events.clone())
            .ok_or_else(|| HistoryError::NotFound(flow_id.clone()))
    }

    async fn list_executions(
        &self,
        workspace_id: &Id,
        statuses: &[RunStatus],
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowExecution>, HistoryError> {
        let executions = self.executions.read();
        let mut out: Vec<_> = executions
            .values()
            .map(|s| &s.execution)
            .filter(|e| {
                &e.workspace_id == workspace_id
                    && statuses.contains(&e.status)
                    && e.updated_at >= since
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidekick_domain::prefixes;

    fn execution(workspace_id: &Id) -> FlowExecution {
        FlowExecution {
            flow_id: Id::generate(prefixes::FLOW),
            workspace_id: workspace_id.clone(),
            parent_id: Id::generate(prefixes::TASK),
            flow_type: "basic_dev".to_string(),
            status: RunStatus::Running,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let store = MemoryRunHistory::new();
        let ws = Id::generate(prefixes::WORKSPACE);
        let exec = execution(&ws);
        let flow_id = exec.flow_id.clone();

        store.create_execution(exec).await.unwrap();

        let seq = store
            .append_event(
                &flow_id,
                0,
                RunEvent::RunStarted {
                    input: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let seq = store
            .append_event(
                &flow_id,
                1,
                RunEvent::SideEffect {
                    value: serde_json::json!("fa_1"),
                },
            )
            .await
            .unwrap();
        assert_eq!(seq, 2);

        let events = store.load_events(&flow_id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_sequence_conflict() {
        let store = MemoryRunHistory::new();
        let ws = Id::generate(prefixes::WORKSPACE);
        let exec = execution(&ws);
        let flow_id = exec.flow_id.clone();
        store.create_execution(exec).await.unwrap();

        let result = store
            .append_event(
                &flow_id,
                5,
                RunEvent::RunStarted {
                    input: serde_json::json!({}),
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(HistoryError::SequenceConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_executions_filters() {
        let store = MemoryRunHistory::new();
        let ws = Id::generate(prefixes::WORKSPACE);
        let other_ws = Id::generate(prefixes::WORKSPACE);

        let mut failed = execution(&ws);
        failed.status = RunStatus::Failed;
        let failed_id = failed.flow_id.clone();
        store.create_execution(failed).await.unwrap();
        store.create_execution(execution(&ws)).await.unwrap();
        store.create_execution(execution(&other_ws)).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let listed = store
            .list_executions(&ws, &[RunStatus::Failed, RunStatus::TimedOut], since)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].flow_id, failed_id);
    }

    #[test]
    fn test_run_event_serialization() {
        let event = RunEvent::VersionMarker {
            change_id: "pause-flow-on-user-request".to_string(),
            version: 1,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"version_marker\""));

        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_terminal_events() {
        assert!(RunEvent::RunCancelled {
            reason: "preempted".to_string()
        }
        .is_terminal());
        assert!(!RunEvent::TimerFired {
            timer_id: "t".to_string()
        }
        .is_terminal());
    }
}
