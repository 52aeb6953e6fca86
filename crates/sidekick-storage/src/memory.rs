//! In-memory storage backend.
//!
//! Primarily for development and tests, with the same semantics as the
//! PostgreSQL backend. All tables live behind one `RwLock`, so every record
//! write updates its secondary sets in the same critical section — the
//! atomicity the port demands comes for free here.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use sidekick_domain::{
    Flow, FlowAction, Id, ProviderKey, Subflow, Task, TaskStatus, Workspace, WorkspaceConfig,
    Worktree,
};

use crate::store::{require_id, ArchivedTaskPage, Storage, StoreError};

/// Archive score: nanoseconds since epoch, falling back to microsecond
/// precision times 1000 if the nanosecond value overflows.
fn archive_score(archived: chrono::DateTime<chrono::Utc>) -> i64 {
    archived
        .timestamp_nanos_opt()
        .unwrap_or_else(|| archived.timestamp_micros().saturating_mul(1000))
}

#[derive(Default)]
struct MemoryInner {
    workspaces: HashMap<Id, Workspace>,
    workspace_configs: HashMap<Id, WorkspaceConfig>,

    tasks: HashMap<Id, Task>,
    // Secondary sets, maintained in lock-step with `tasks`.
    tasks_by_status: HashMap<(Id, TaskStatus), BTreeSet<Id>>,
    archived_tasks: HashMap<Id, BTreeMap<(i64, Id), ()>>,

    flows: HashMap<Id, Flow>,
    subflows: HashMap<Id, Subflow>,

    flow_actions: HashMap<Id, FlowAction>,
    // Per-flow insertion order of action ids.
    flow_action_order: HashMap<Id, Vec<Id>>,

    worktrees: HashMap<Id, Worktree>,
    provider_keys: HashMap<String, ProviderKey>,
}

impl MemoryInner {
    fn detach_task_indexes(&mut self, task: &Task) {
        for status in TaskStatus::ALL {
            if let Some(bucket) = self
                .tasks_by_status
                .get_mut(&(task.workspace_id.clone(), status))
            {
                bucket.remove(&task.id);
            }
        }
        if let Some(archive) = self.archived_tasks.get_mut(&task.workspace_id) {
            archive.retain(|(_, id), _| id != &task.id);
        }
    }

    fn attach_task_indexes(&mut self, task: &Task) {
        if let Some(archived) = task.archived {
            self.archived_tasks
                .entry(task.workspace_id.clone())
                .or_default()
                .insert((archive_score(archived), task.id.clone()), ());
        } else {
            self.tasks_by_status
                .entry((task.workspace_id.clone(), task.status))
                .or_default()
                .insert(task.id.clone());
        }
    }
}

/// In-memory implementation of the storage port.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks (for tests).
    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn persist_workspace(&self, workspace: Workspace) -> Result<(), StoreError> {
        require_id(&workspace.id, "workspace id")?;
        self.inner
            .write()
            .workspaces
            .insert(workspace.id.clone(), workspace);
        Ok(())
    }

    async fn get_workspace(&self, id: &Id) -> Result<Workspace, StoreError> {
        self.inner
            .read()
            .workspaces
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workspace {id}")))
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        let mut out: Vec<_> = self.inner.read().workspaces.values().cloned().collect();
        out.sort_by(|a, b| (a.name.as_str(), &a.id).cmp(&(b.name.as_str(), &b.id)));
        Ok(out)
    }

    async fn delete_workspace(&self, id: &Id) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.workspaces.remove(id);
        inner.workspace_configs.remove(id);
        Ok(())
    }

    async fn persist_workspace_config(&self, config: WorkspaceConfig) -> Result<(), StoreError> {
        require_id(&config.workspace_id, "workspace id")?;
        self.inner
            .write()
            .workspace_configs
            .insert(config.workspace_id.clone(), config);
        Ok(())
    }

    async fn get_workspace_config(
        &self,
        workspace_id: &Id,
    ) -> Result<WorkspaceConfig, StoreError> {
        self.inner
            .read()
            .workspace_configs
            .get(workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workspace config {workspace_id}")))
    }

    async fn persist_task(&self, task: Task) -> Result<(), StoreError> {
        require_id(&task.id, "task id")?;
        require_id(&task.workspace_id, "workspace id")?;

        let mut inner = self.inner.write();
        if let Some(previous) = inner.tasks.get(&task.id).cloned() {
            inner.detach_task_indexes(&previous);
        }
        inner.attach_task_indexes(&task);
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, workspace_id: &Id, id: &Id) -> Result<Task, StoreError> {
        self.inner
            .read()
            .tasks
            .get(id)
            .filter(|t| &t.workspace_id == workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    async fn delete_task(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let existing = inner
            .tasks
            .get(id)
            .filter(|t| &t.workspace_id == workspace_id)
            .cloned();
        if let Some(task) = existing {
            inner.detach_task_indexes(&task);
            inner.tasks.remove(id);
        }
        Ok(())
    }

    async fn list_tasks_by_status(
        &self,
        workspace_id: &Id,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for status in statuses {
            if let Some(bucket) = inner
                .tasks_by_status
                .get(&(workspace_id.clone(), *status))
            {
                for id in bucket {
                    if let Some(task) = inner.tasks.get(id) {
                        out.push(task.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn list_archived_tasks(
        &self,
        workspace_id: &Id,
        page: u64,
        page_size: u64,
    ) -> Result<ArchivedTaskPage, StoreError> {
        let inner = self.inner.read();
        let Some(archive) = inner.archived_tasks.get(workspace_id) else {
            return Ok(ArchivedTaskPage {
                tasks: vec![],
                total: 0,
            });
        };

        let total = archive.len() as u64;
        let offset = page.saturating_sub(1).saturating_mul(page_size) as usize;

        let tasks = archive
            .keys()
            .rev()
            .skip(offset)
            .take(page_size as usize)
            .filter_map(|(_, id)| inner.tasks.get(id).cloned())
            .collect();

        Ok(ArchivedTaskPage { tasks, total })
    }

    async fn persist_flow(&self, flow: Flow) -> Result<(), StoreError> {
        require_id(&flow.id, "flow id")?;
        require_id(&flow.workspace_id, "workspace id")?;
        self.inner.write().flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn get_flow(&self, workspace_id: &Id, id: &Id) -> Result<Flow, StoreError> {
        self.inner
            .read()
            .flows
            .get(id)
            .filter(|f| &f.workspace_id == workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("flow {id}")))
    }

    async fn list_flows_by_task(
        &self,
        workspace_id: &Id,
        task_id: &Id,
    ) -> Result<Vec<Flow>, StoreError> {
        self.list_flows_by_parent(workspace_id, task_id).await
    }

    async fn list_flows_by_parent(
        &self,
        workspace_id: &Id,
        parent_id: &Id,
    ) -> Result<Vec<Flow>, StoreError> {
        let inner = self.inner.read();
        let mut out: Vec<_> = inner
            .flows
            .values()
            .filter(|f| &f.workspace_id == workspace_id && &f.parent_id == parent_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn delete_flow(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let matches = inner
            .flows
            .get(id)
            .map(|f| &f.workspace_id == workspace_id)
            .unwrap_or(false);
        if matches {
            inner.flows.remove(id);
        }
        Ok(())
    }

    async fn persist_subflow(&self, subflow: Subflow) -> Result<(), StoreError> {
        require_id(&subflow.id, "subflow id")?;
        require_id(&subflow.workspace_id, "workspace id")?;
        require_id(&subflow.flow_id, "flow id")?;

        let mut inner = self.inner.write();
        if let Some(parent_id) = &subflow.parent_subflow_id {
            let parent_ok = inner
                .subflows
                .get(parent_id)
                .map(|p| p.flow_id == subflow.flow_id)
                .unwrap_or(false);
            if !parent_ok {
                return Err(StoreError::Validation(format!(
                    "parent subflow {parent_id} not persisted in flow {}",
                    subflow.flow_id
                )));
            }
        }
        inner.subflows.insert(subflow.id.clone(), subflow);
        Ok(())
    }

    async fn get_subflow(&self, workspace_id: &Id, id: &Id) -> Result<Subflow, StoreError> {
        self.inner
            .read()
            .subflows
            .get(id)
            .filter(|s| &s.workspace_id == workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("subflow {id}")))
    }

    async fn list_subflows_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<Subflow>, StoreError> {
        let inner = self.inner.read();
        let mut out: Vec<_> = inner
            .subflows
            .values()
            .filter(|s| &s.workspace_id == workspace_id && &s.flow_id == flow_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn persist_flow_action(&self, action: FlowAction) -> Result<(), StoreError> {
        if !action.has_required_ids() {
            return Err(StoreError::Validation(
                "flow action requires id, workspace id and flow id".to_string(),
            ));
        }

        let mut inner = self.inner.write();
        if !inner.flow_actions.contains_key(&action.id) {
            inner
                .flow_action_order
                .entry(action.flow_id.clone())
                .or_default()
                .push(action.id.clone());
        }
        inner.flow_actions.insert(action.id.clone(), action);
        Ok(())
    }

    async fn get_flow_action(
        &self,
        workspace_id: &Id,
        id: &Id,
    ) -> Result<FlowAction, StoreError> {
        self.inner
            .read()
            .flow_actions
            .get(id)
            .filter(|a| &a.workspace_id == workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("flow action {id}")))
    }

    async fn list_flow_actions(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<FlowAction>, StoreError> {
        let inner = self.inner.read();
        let Some(order) = inner.flow_action_order.get(flow_id) else {
            return Ok(vec![]);
        };
        Ok(order
            .iter()
            .filter_map(|id| inner.flow_actions.get(id))
            .filter(|a| &a.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn delete_flow_actions_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(order) = inner.flow_action_order.remove(flow_id) {
            for id in order {
                let matches = inner
                    .flow_actions
                    .get(&id)
                    .map(|a| &a.workspace_id == workspace_id)
                    .unwrap_or(false);
                if matches {
                    inner.flow_actions.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn persist_worktree(&self, worktree: Worktree) -> Result<(), StoreError> {
        require_id(&worktree.id, "worktree id")?;
        require_id(&worktree.workspace_id, "workspace id")?;
        require_id(&worktree.flow_id, "flow id")?;
        self.inner
            .write()
            .worktrees
            .insert(worktree.id.clone(), worktree);
        Ok(())
    }

    async fn get_worktree(&self, workspace_id: &Id, id: &Id) -> Result<Worktree, StoreError> {
        self.inner
            .read()
            .worktrees
            .get(id)
            .filter(|w| &w.workspace_id == workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("worktree {id}")))
    }

    async fn list_worktrees_by_workspace(
        &self,
        workspace_id: &Id,
    ) -> Result<Vec<Worktree>, StoreError> {
        let inner = self.inner.read();
        let mut out: Vec<_> = inner
            .worktrees
            .values()
            .filter(|w| &w.workspace_id == workspace_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn list_worktrees_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<Worktree>, StoreError> {
        let inner = self.inner.read();
        let mut out: Vec<_> = inner
            .worktrees
            .values()
            .filter(|w| &w.workspace_id == workspace_id && &w.flow_id == flow_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn delete_worktree(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let matches = inner
            .worktrees
            .get(id)
            .map(|w| &w.workspace_id == workspace_id)
            .unwrap_or(false);
        if matches {
            inner.worktrees.remove(id);
        }
        Ok(())
    }

    async fn persist_provider_key(&self, key: ProviderKey) -> Result<(), StoreError> {
        key.validate()
            .map_err(|field| StoreError::Validation(format!("provider key missing {field}")))?;
        self.inner
            .write()
            .provider_keys
            .insert(key.id.clone(), key);
        Ok(())
    }

    async fn get_provider_key(&self, id: &str) -> Result<ProviderKey, StoreError> {
        self.inner
            .read()
            .provider_keys
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("provider key {id}")))
    }

    async fn list_provider_keys(&self) -> Result<Vec<ProviderKey>, StoreError> {
        let mut out: Vec<_> = self.inner.read().provider_keys.values().cloned().collect();
        out.sort_by_key(|k| k.sort_key());
        Ok(out)
    }

    async fn delete_provider_key(&self, id: &str) -> Result<(), StoreError> {
        self.inner.write().provider_keys.remove(id);
        Ok(())
    }
}
