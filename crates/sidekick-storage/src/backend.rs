// Storage backend abstraction
// Decision: Use enum dispatch for simplicity over trait objects
//
// The delegator makes no policy decisions; it only dispatches each port
// operation to the configured backend.

use std::sync::Arc;

use async_trait::async_trait;

use sidekick_domain::{
    Flow, FlowAction, Id, ProviderKey, Subflow, Task, TaskStatus, Workspace, WorkspaceConfig,
    Worktree,
};

use crate::memory::MemoryStorage;
use crate::postgres::PostgresStorage;
use crate::store::{ArchivedTaskPage, Storage, StoreError};

/// Storage backend that can be either PostgreSQL or in-memory.
#[derive(Clone)]
pub enum StorageBackend {
    /// PostgreSQL database (production)
    Postgres(PostgresStorage),
    /// In-memory store (dev mode and tests)
    Memory(Arc<MemoryStorage>),
}

impl StorageBackend {
    pub async fn postgres(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::Postgres(PostgresStorage::from_url(database_url).await?))
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryStorage::new()))
    }

    pub fn is_dev_mode(&self) -> bool {
        matches!(self, Self::Memory(_))
    }
}

#[async_trait]
impl Storage for StorageBackend {
    async fn persist_workspace(&self, workspace: Workspace) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.persist_workspace(workspace).await,
            Self::Memory(s) => s.persist_workspace(workspace).await,
        }
    }

    async fn get_workspace(&self, id: &Id) -> Result<Workspace, StoreError> {
        match self {
            Self::Postgres(s) => s.get_workspace(id).await,
            Self::Memory(s) => s.get_workspace(id).await,
        }
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_workspaces().await,
            Self::Memory(s) => s.list_workspaces().await,
        }
    }

    async fn delete_workspace(&self, id: &Id) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.delete_workspace(id).await,
            Self::Memory(s) => s.delete_workspace(id).await,
        }
    }

    async fn persist_workspace_config(&self, config: WorkspaceConfig) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.persist_workspace_config(config).await,
            Self::Memory(s) => s.persist_workspace_config(config).await,
        }
    }

    async fn get_workspace_config(
        &self,
        workspace_id: &Id,
    ) -> Result<WorkspaceConfig, StoreError> {
        match self {
            Self::Postgres(s) => s.get_workspace_config(workspace_id).await,
            Self::Memory(s) => s.get_workspace_config(workspace_id).await,
        }
    }

    async fn persist_task(&self, task: Task) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.persist_task(task).await,
            Self::Memory(s) => s.persist_task(task).await,
        }
    }

    async fn get_task(&self, workspace_id: &Id, id: &Id) -> Result<Task, StoreError> {
        match self {
            Self::Postgres(s) => s.get_task(workspace_id, id).await,
            Self::Memory(s) => s.get_task(workspace_id, id).await,
        }
    }

    async fn delete_task(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.delete_task(workspace_id, id).await,
            Self::Memory(s) => s.delete_task(workspace_id, id).await,
        }
    }

    async fn list_tasks_by_status(
        &self,
        workspace_id: &Id,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_tasks_by_status(workspace_id, statuses).await,
            Self::Memory(s) => s.list_tasks_by_status(workspace_id, statuses).await,
        }
    }

    async fn list_archived_tasks(
        &self,
        workspace_id: &Id,
        page: u64,
        page_size: u64,
    ) -> Result<ArchivedTaskPage, StoreError> {
        match self {
            Self::Postgres(s) => s.list_archived_tasks(workspace_id, page, page_size).await,
            Self::Memory(s) => s.list_archived_tasks(workspace_id, page, page_size).await,
        }
    }

    async fn persist_flow(&self, flow: Flow) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.persist_flow(flow).await,
            Self::Memory(s) => s.persist_flow(flow).await,
        }
    }

    async fn get_flow(&self, workspace_id: &Id, id: &Id) -> Result<Flow, StoreError> {
        match self {
            Self::Postgres(s) => s.get_flow(workspace_id, id).await,
            Self::Memory(s) => s.get_flow(workspace_id, id).await,
        }
    }

    async fn list_flows_by_task(
        &self,
        workspace_id: &Id,
        task_id: &Id,
    ) -> Result<Vec<Flow>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_flows_by_task(workspace_id, task_id).await,
            Self::Memory(s) => s.list_flows_by_task(workspace_id, task_id).await,
        }
    }

    async fn list_flows_by_parent(
        &self,
        workspace_id: &Id,
        parent_id: &Id,
    ) -> Result<Vec<Flow>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_flows_by_parent(workspace_id, parent_id).await,
            Self::Memory(s) => s.list_flows_by_parent(workspace_id, parent_id).await,
        }
    }

    async fn delete_flow(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.delete_flow(workspace_id, id).await,
            Self::Memory(s) => s.delete_flow(workspace_id, id).await,
        }
    }

    async fn persist_subflow(&self, subflow: Subflow) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.persist_subflow(subflow).await,
            Self::Memory(s) => s.persist_subflow(subflow).await,
        }
    }

    async fn get_subflow(&self, workspace_id: &Id, id: &Id) -> Result<Subflow, StoreError> {
        match self {
            Self::Postgres(s) => s.get_subflow(workspace_id, id).await,
            Self::Memory(s) => s.get_subflow(workspace_id, id).await,
        }
    }

    async fn list_subflows_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<Subflow>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_subflows_by_flow(workspace_id, flow_id).await,
            Self::Memory(s) => s.list_subflows_by_flow(workspace_id, flow_id).await,
        }
    }

    async fn persist_flow_action(&self, action: FlowAction) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.persist_flow_action(action).await,
            Self::Memory(s) => s.persist_flow_action(action).await,
        }
    }

    async fn get_flow_action(
        &self,
        workspace_id: &Id,
        id: &Id,
    ) -> Result<FlowAction, StoreError> {
        match self {
            Self::Postgres(s) => s.get_flow_action(workspace_id, id).await,
            Self::Memory(s) => s.get_flow_action(workspace_id, id).await,
        }
    }

    async fn list_flow_actions(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<FlowAction>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_flow_actions(workspace_id, flow_id).await,
            Self::Memory(s) => s.list_flow_actions(workspace_id, flow_id).await,
        }
    }

    async fn delete_flow_actions_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.delete_flow_actions_by_flow(workspace_id, flow_id).await,
            Self::Memory(s) => s.delete_flow_actions_by_flow(workspace_id, flow_id).await,
        }
    }

    async fn persist_worktree(&self, worktree: Worktree) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.persist_worktree(worktree).await,
            Self::Memory(s) => s.persist_worktree(worktree).await,
        }
    }

    async fn get_worktree(&self, workspace_id: &Id, id: &Id) -> Result<Worktree, StoreError> {
        match self {
            Self::Postgres(s) => s.get_worktree(workspace_id, id).await,
            Self::Memory(s) => s.get_worktree(workspace_id, id).await,
        }
    }

    async fn list_worktrees_by_workspace(
        &self,
        workspace_id: &Id,
    ) -> Result<Vec<Worktree>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_worktrees_by_workspace(workspace_id).await,
            Self::Memory(s) => s.list_worktrees_by_workspace(workspace_id).await,
        }
    }

    async fn list_worktrees_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<Worktree>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_worktrees_by_flow(workspace_id, flow_id).await,
            Self::Memory(s) => s.list_worktrees_by_flow(workspace_id, flow_id).await,
        }
    }

    async fn delete_worktree(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.delete_worktree(workspace_id, id).await,
            Self::Memory(s) => s.delete_worktree(workspace_id, id).await,
        }
    }

    async fn persist_provider_key(&self, key: ProviderKey) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.persist_provider_key(key).await,
            Self::Memory(s) => s.persist_provider_key(key).await,
        }
    }

    async fn get_provider_key(&self, id: &str) -> Result<ProviderKey, StoreError> {
        match self {
            Self::Postgres(s) => s.get_provider_key(id).await,
            Self::Memory(s) => s.get_provider_key(id).await,
        }
    }

    async fn list_provider_keys(&self) -> Result<Vec<ProviderKey>, StoreError> {
        match self {
            Self::Postgres(s) => s.list_provider_keys().await,
            Self::Memory(s) => s.list_provider_keys().await,
        }
    }

    async fn delete_provider_key(&self, id: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(s) => s.delete_provider_key(id).await,
            Self::Memory(s) => s.delete_provider_key(id).await,
        }
    }
}
