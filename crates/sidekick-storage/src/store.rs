//! Storage port trait definition

use async_trait::async_trait;

use sidekick_domain::{
    Flow, FlowAction, Id, ProviderKey, Subflow, Task, TaskStatus, Workspace, WorkspaceConfig,
    Worktree,
};

/// Error type for storage operations.
///
/// `NotFound` and `Validation` are non-retryable; `Transport` and
/// `Serialization` surface backend trouble and are eligible for activity
/// retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Key absent. Idempotent deletes swallow this; everything else surfaces it.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input (missing required id, dangling parent reference, …).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Backend or network failure.
    #[error("storage transport error: {0}")]
    Transport(String),

    /// Encoding or decoding of a stored value failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A page of archived tasks plus the archive's total size.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedTaskPage {
    pub tasks: Vec<Task>,
    pub total: u64,
}

/// Durable persistence of the domain entities.
///
/// Callers supply fully populated entities; persists are idempotent upserts.
/// List operations return an empty `Vec` (never an error) when nothing
/// matches, and deletes treat a missing key as success. Secondary access
/// paths (status buckets, archived ordering) are updated atomically with the
/// record.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // =========================================================================
    // Workspaces
    // =========================================================================

    async fn persist_workspace(&self, workspace: Workspace) -> Result<(), StoreError>;

    async fn get_workspace(&self, id: &Id) -> Result<Workspace, StoreError>;

    /// All workspaces, ordered by name then id.
    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError>;

    async fn delete_workspace(&self, id: &Id) -> Result<(), StoreError>;

    async fn persist_workspace_config(&self, config: WorkspaceConfig) -> Result<(), StoreError>;

    async fn get_workspace_config(&self, workspace_id: &Id)
        -> Result<WorkspaceConfig, StoreError>;

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn persist_task(&self, task: Task) -> Result<(), StoreError>;

    async fn get_task(&self, workspace_id: &Id, id: &Id) -> Result<Task, StoreError>;

    async fn delete_task(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError>;

    /// Non-archived tasks in the given status buckets.
    async fn list_tasks_by_status(
        &self,
        workspace_id: &Id,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError>;

    /// Archived tasks, most recently archived first. `page` is 1-based.
    async fn list_archived_tasks(
        &self,
        workspace_id: &Id,
        page: u64,
        page_size: u64,
    ) -> Result<ArchivedTaskPage, StoreError>;

    // =========================================================================
    // Flows
    // =========================================================================

    async fn persist_flow(&self, flow: Flow) -> Result<(), StoreError>;

    async fn get_flow(&self, workspace_id: &Id, id: &Id) -> Result<Flow, StoreError>;

    async fn list_flows_by_task(
        &self,
        workspace_id: &Id,
        task_id: &Id,
    ) -> Result<Vec<Flow>, StoreError>;

    async fn list_flows_by_parent(
        &self,
        workspace_id: &Id,
        parent_id: &Id,
    ) -> Result<Vec<Flow>, StoreError>;

    async fn delete_flow(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError>;

    // =========================================================================
    // Subflows
    // =========================================================================

    /// Persist a subflow. A populated `parent_subflow_id` must reference an
    /// already-persisted subflow of the same flow.
    async fn persist_subflow(&self, subflow: Subflow) -> Result<(), StoreError>;

    async fn get_subflow(&self, workspace_id: &Id, id: &Id) -> Result<Subflow, StoreError>;

    async fn list_subflows_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<Subflow>, StoreError>;

    // =========================================================================
    // Flow actions
    // =========================================================================

    async fn persist_flow_action(&self, action: FlowAction) -> Result<(), StoreError>;

    async fn get_flow_action(&self, workspace_id: &Id, id: &Id)
        -> Result<FlowAction, StoreError>;

    /// Actions of one flow, insertion order preserved.
    async fn list_flow_actions(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<FlowAction>, StoreError>;

    async fn delete_flow_actions_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Worktrees
    // =========================================================================

    async fn persist_worktree(&self, worktree: Worktree) -> Result<(), StoreError>;

    async fn get_worktree(&self, workspace_id: &Id, id: &Id) -> Result<Worktree, StoreError>;

    async fn list_worktrees_by_workspace(
        &self,
        workspace_id: &Id,
    ) -> Result<Vec<Worktree>, StoreError>;

    /// Worktrees of one flow. Keys off workspace *and* flow so flows with
    /// colliding ids across workspaces cannot bleed into each other.
    async fn list_worktrees_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<Worktree>, StoreError>;

    async fn delete_worktree(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError>;

    // =========================================================================
    // Provider keys
    // =========================================================================

    /// Persist a provider key after validating it.
    async fn persist_provider_key(&self, key: ProviderKey) -> Result<(), StoreError>;

    async fn get_provider_key(&self, id: &str) -> Result<ProviderKey, StoreError>;

    /// All provider keys, ordered by nickname then id.
    async fn list_provider_keys(&self) -> Result<Vec<ProviderKey>, StoreError>;

    async fn delete_provider_key(&self, id: &str) -> Result<(), StoreError>;
}

pub(crate) fn require_id(id: &Id, field: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::Validation(format!("missing {field}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(StoreError::NotFound("x".into()).is_not_found());
        assert!(StoreError::Transport("timeout".into()).is_transient());
        assert!(!StoreError::Validation("missing id".into()).is_transient());
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }
}
