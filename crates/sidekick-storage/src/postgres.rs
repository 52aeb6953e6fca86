//! PostgreSQL storage backend.
//!
//! Runtime queries (`query_as` + `bind`) against the schema in `schema.sql`.
//! Upserts are `INSERT … ON CONFLICT DO UPDATE` so a record write and its
//! index maintenance are one atomic statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use sidekick_domain::{
    ActionStatus, ConfigMode, Flow, FlowAction, FlowStatus, Id, ProviderKey, SecretManagerType,
    Subflow, SubflowStatus, Task, TaskStatus, Workspace, WorkspaceConfig, Worktree,
};

use crate::store::{require_id, ArchivedTaskPage, Storage, StoreError};

const SCHEMA: &str = include_str!("schema.sql");

/// Encode a unit enum as its wire string.
fn encode_enum<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization(format!(
            "expected string enum, got {other}"
        ))),
    }
}

/// Decode a unit enum from its wire string.
fn decode_enum<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Serialization(format!("bad enum value {raw:?}: {e}")))
}

#[derive(FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    local_repo_dir: String,
    config_mode: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl WorkspaceRow {
    fn into_workspace(self) -> Result<Workspace, StoreError> {
        Ok(Workspace {
            id: Id::new(self.id),
            name: self.name,
            local_repo_dir: self.local_repo_dir,
            config_mode: decode_enum::<ConfigMode>(&self.config_mode)?,
            created: self.created,
            updated: self.updated,
        })
    }
}

#[derive(FromRow)]
struct WorkspaceConfigRow {
    workspace_id: String,
    settings: serde_json::Value,
    updated: DateTime<Utc>,
}

#[derive(FromRow)]
struct TaskRow {
    id: String,
    workspace_id: String,
    title: String,
    description: String,
    status: String,
    agent_type: String,
    flow_type: String,
    flow_options: Option<serde_json::Value>,
    links: serde_json::Value,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    archived: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, StoreError> {
        let flow_options = match self.flow_options {
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => {
                return Err(StoreError::Serialization(format!(
                    "flow options not an object: {other}"
                )))
            }
        };
        Ok(Task {
            id: Id::new(self.id),
            workspace_id: Id::new(self.workspace_id),
            title: self.title,
            description: self.description,
            status: decode_enum::<TaskStatus>(&self.status)?,
            agent_type: self.agent_type,
            flow_type: self.flow_type,
            flow_options,
            links: serde_json::from_value(self.links)?,
            created: self.created,
            updated: self.updated,
            archived: self.archived,
        })
    }
}

#[derive(FromRow)]
struct FlowRow {
    id: String,
    workspace_id: String,
    flow_type: String,
    parent_id: String,
    status: String,
}

impl FlowRow {
    fn into_flow(self) -> Result<Flow, StoreError> {
        Ok(Flow {
            id: Id::new(self.id),
            workspace_id: Id::new(self.workspace_id),
            flow_type: self.flow_type,
            parent_id: Id::new(self.parent_id),
            status: decode_enum::<FlowStatus>(&self.status)?,
        })
    }
}

#[derive(FromRow)]
struct SubflowRow {
    id: String,
    workspace_id: String,
    flow_id: String,
    name: String,
    subflow_type: Option<String>,
    description: String,
    status: String,
    parent_subflow_id: Option<String>,
    result: Option<String>,
}

impl SubflowRow {
    fn into_subflow(self) -> Result<Subflow, StoreError> {
        Ok(Subflow {
            id: Id::new(self.id),
            workspace_id: Id::new(self.workspace_id),
            flow_id: Id::new(self.flow_id),
            name: self.name,
            subflow_type: self.subflow_type,
            description: self.description,
            status: decode_enum::<SubflowStatus>(&self.status)?,
            parent_subflow_id: self.parent_subflow_id.map(Id::new),
            result: self.result,
        })
    }
}

#[derive(FromRow)]
struct FlowActionRow {
    id: String,
    workspace_id: String,
    flow_id: String,
    subflow_id: Option<String>,
    subflow_name: String,
    action_type: String,
    action_params: serde_json::Value,
    status: String,
    result: String,
    is_human_action: bool,
    is_callback_action: bool,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl FlowActionRow {
    fn into_action(self) -> Result<FlowAction, StoreError> {
        let action_params = match self.action_params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(StoreError::Serialization(format!(
                    "action params not an object: {other}"
                )))
            }
        };
        Ok(FlowAction {
            id: Id::new(self.id),
            workspace_id: Id::new(self.workspace_id),
            flow_id: Id::new(self.flow_id),
            subflow_id: self.subflow_id.map(Id::new),
            subflow_name: self.subflow_name,
            action_type: self.action_type,
            action_params,
            status: decode_enum::<ActionStatus>(&self.status)?,
            result: self.result,
            is_human_action: self.is_human_action,
            is_callback_action: self.is_callback_action,
            created: self.created,
            updated: self.updated,
        })
    }
}

#[derive(FromRow)]
struct WorktreeRow {
    id: String,
    workspace_id: String,
    flow_id: String,
    name: String,
    working_directory: String,
    created: DateTime<Utc>,
}

impl WorktreeRow {
    fn into_worktree(self) -> Worktree {
        Worktree {
            id: Id::new(self.id),
            workspace_id: Id::new(self.workspace_id),
            flow_id: Id::new(self.flow_id),
            name: self.name,
            working_directory: self.working_directory,
            created: self.created,
        }
    }
}

#[derive(FromRow)]
struct ProviderKeyRow {
    id: String,
    provider_type: String,
    nickname: Option<String>,
    secret_manager_type: String,
    secret_name: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl ProviderKeyRow {
    fn into_key(self) -> Result<ProviderKey, StoreError> {
        Ok(ProviderKey {
            id: self.id,
            provider_type: self.provider_type,
            nickname: self.nickname,
            secret_manager_type: decode_enum::<SecretManagerType>(&self.secret_manager_type)?,
            secret_name: self.secret_name,
            created: self.created,
            updated: self.updated,
        })
    }
}

/// PostgreSQL implementation of the storage port.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the schema.
    pub async fn from_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        let storage = Self::new(pool);
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::debug!("storage schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn persist_workspace(&self, workspace: Workspace) -> Result<(), StoreError> {
        require_id(&workspace.id, "workspace id")?;
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, local_repo_dir, config_mode, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                local_repo_dir = EXCLUDED.local_repo_dir,
                config_mode = EXCLUDED.config_mode,
                updated = EXCLUDED.updated
            "#,
        )
        .bind(workspace.id.as_str())
        .bind(&workspace.name)
        .bind(&workspace.local_repo_dir)
        .bind(encode_enum(&workspace.config_mode)?)
        .bind(workspace.created)
        .bind(workspace.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workspace(&self, id: &Id) -> Result<Workspace, StoreError> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT id, name, local_repo_dir, config_mode, created, updated FROM workspaces WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workspace {id}")))?;
        row.into_workspace()
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT id, name, local_repo_dir, config_mode, created, updated FROM workspaces ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkspaceRow::into_workspace).collect()
    }

    async fn delete_workspace(&self, id: &Id) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workspace_configs WHERE workspace_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM workspaces WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn persist_workspace_config(&self, config: WorkspaceConfig) -> Result<(), StoreError> {
        require_id(&config.workspace_id, "workspace id")?;
        sqlx::query(
            r#"
            INSERT INTO workspace_configs (workspace_id, settings, updated)
            VALUES ($1, $2, $3)
            ON CONFLICT (workspace_id) DO UPDATE SET
                settings = EXCLUDED.settings,
                updated = EXCLUDED.updated
            "#,
        )
        .bind(config.workspace_id.as_str())
        .bind(&config.settings)
        .bind(config.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workspace_config(
        &self,
        workspace_id: &Id,
    ) -> Result<WorkspaceConfig, StoreError> {
        let row = sqlx::query_as::<_, WorkspaceConfigRow>(
            "SELECT workspace_id, settings, updated FROM workspace_configs WHERE workspace_id = $1",
        )
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workspace config {workspace_id}")))?;

        Ok(WorkspaceConfig {
            workspace_id: Id::new(row.workspace_id),
            settings: row.settings,
            updated: row.updated,
        })
    }

    async fn persist_task(&self, task: Task) -> Result<(), StoreError> {
        require_id(&task.id, "task id")?;
        require_id(&task.workspace_id, "workspace id")?;

        let flow_options = task
            .flow_options
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()));

        sqlx::query(
            r#"
            INSERT INTO tasks (id, workspace_id, title, description, status, agent_type,
                               flow_type, flow_options, links, created, updated, archived)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                agent_type = EXCLUDED.agent_type,
                flow_type = EXCLUDED.flow_type,
                flow_options = EXCLUDED.flow_options,
                links = EXCLUDED.links,
                updated = EXCLUDED.updated,
                archived = EXCLUDED.archived
            "#,
        )
        .bind(task.id.as_str())
        .bind(task.workspace_id.as_str())
        .bind(&task.title)
        .bind(&task.description)
        .bind(encode_enum(&task.status)?)
        .bind(&task.agent_type)
        .bind(&task.flow_type)
        .bind(flow_options)
        .bind(serde_json::to_value(&task.links)?)
        .bind(task.created)
        .bind(task.updated)
        .bind(task.archived)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, workspace_id: &Id, id: &Id) -> Result<Task, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, workspace_id, title, description, status, agent_type, flow_type, \
             flow_options, links, created, updated, archived \
             FROM tasks WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id.as_str())
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
        row.into_task()
    }

    async fn delete_task(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks WHERE id = $1 AND workspace_id = $2")
            .bind(id.as_str())
            .bind(workspace_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_tasks_by_status(
        &self,
        workspace_id: &Id,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError> {
        let mut out = Vec::new();
        for status in statuses {
            let rows = sqlx::query_as::<_, TaskRow>(
                "SELECT id, workspace_id, title, description, status, agent_type, flow_type, \
                 flow_options, links, created, updated, archived \
                 FROM tasks \
                 WHERE workspace_id = $1 AND status = $2 AND archived IS NULL \
                 ORDER BY id",
            )
            .bind(workspace_id.as_str())
            .bind(encode_enum(status)?)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.push(row.into_task()?);
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
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE workspace_id = $1 AND archived IS NOT NULL",
        )
        .bind(workspace_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let offset = page.saturating_sub(1).saturating_mul(page_size);
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT id, workspace_id, title, description, status, agent_type, flow_type, \
             flow_options, links, created, updated, archived \
             FROM tasks \
             WHERE workspace_id = $1 AND archived IS NOT NULL \
             ORDER BY archived DESC, id DESC LIMIT $2 OFFSET $3",
        )
        .bind(workspace_id.as_str())
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ArchivedTaskPage {
            tasks,
            total: total as u64,
        })
    }

    async fn persist_flow(&self, flow: Flow) -> Result<(), StoreError> {
        require_id(&flow.id, "flow id")?;
        require_id(&flow.workspace_id, "workspace id")?;
        sqlx::query(
            r#"
            INSERT INTO flows (id, workspace_id, flow_type, parent_id, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                flow_type = EXCLUDED.flow_type,
                parent_id = EXCLUDED.parent_id,
                status = EXCLUDED.status
            "#,
        )
        .bind(flow.id.as_str())
        .bind(flow.workspace_id.as_str())
        .bind(&flow.flow_type)
        .bind(flow.parent_id.as_str())
        .bind(encode_enum(&flow.status)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_flow(&self, workspace_id: &Id, id: &Id) -> Result<Flow, StoreError> {
        let row = sqlx::query_as::<_, FlowRow>(
            "SELECT id, workspace_id, flow_type, parent_id, status FROM flows \
             WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id.as_str())
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("flow {id}")))?;
        row.into_flow()
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
        let rows = sqlx::query_as::<_, FlowRow>(
            "SELECT id, workspace_id, flow_type, parent_id, status FROM flows \
             WHERE workspace_id = $1 AND parent_id = $2 ORDER BY id",
        )
        .bind(workspace_id.as_str())
        .bind(parent_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FlowRow::into_flow).collect()
    }

    async fn delete_flow(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flows WHERE id = $1 AND workspace_id = $2")
            .bind(id.as_str())
            .bind(workspace_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn persist_subflow(&self, subflow: Subflow) -> Result<(), StoreError> {
        require_id(&subflow.id, "subflow id")?;
        require_id(&subflow.workspace_id, "workspace id")?;
        require_id(&subflow.flow_id, "flow id")?;

        if let Some(parent_id) = &subflow.parent_subflow_id {
            let parent_ok: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM subflows WHERE id = $1 AND flow_id = $2")
                    .bind(parent_id.as_str())
                    .bind(subflow.flow_id.as_str())
                    .fetch_optional(&self.pool)
                    .await?;
            if parent_ok.is_none() {
                return Err(StoreError::Validation(format!(
                    "parent subflow {parent_id} not persisted in flow {}",
                    subflow.flow_id
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO subflows (id, workspace_id, flow_id, name, subflow_type,
                                  description, status, parent_subflow_id, result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                subflow_type = EXCLUDED.subflow_type,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                parent_subflow_id = EXCLUDED.parent_subflow_id,
                result = EXCLUDED.result
            "#,
        )
        .bind(subflow.id.as_str())
        .bind(subflow.workspace_id.as_str())
        .bind(subflow.flow_id.as_str())
        .bind(&subflow.name)
        .bind(&subflow.subflow_type)
        .bind(&subflow.description)
        .bind(encode_enum(&subflow.status)?)
        .bind(subflow.parent_subflow_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(&subflow.result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subflow(&self, workspace_id: &Id, id: &Id) -> Result<Subflow, StoreError> {
        let row = sqlx::query_as::<_, SubflowRow>(
            "SELECT id, workspace_id, flow_id, name, subflow_type, description, status, \
             parent_subflow_id, result FROM subflows WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id.as_str())
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("subflow {id}")))?;
        row.into_subflow()
    }

    async fn list_subflows_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<Subflow>, StoreError> {
        let rows = sqlx::query_as::<_, SubflowRow>(
            "SELECT id, workspace_id, flow_id, name, subflow_type, description, status, \
             parent_subflow_id, result FROM subflows \
             WHERE workspace_id = $1 AND flow_id = $2 ORDER BY id",
        )
        .bind(workspace_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SubflowRow::into_subflow).collect()
    }

    async fn persist_flow_action(&self, action: FlowAction) -> Result<(), StoreError> {
        if !action.has_required_ids() {
            return Err(StoreError::Validation(
                "flow action requires id, workspace id and flow id".to_string(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO flow_actions (id, workspace_id, flow_id, subflow_id, subflow_name,
                                      action_type, action_params, status, result,
                                      is_human_action, is_callback_action, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                subflow_id = EXCLUDED.subflow_id,
                subflow_name = EXCLUDED.subflow_name,
                action_type = EXCLUDED.action_type,
                action_params = EXCLUDED.action_params,
                status = EXCLUDED.status,
                result = EXCLUDED.result,
                is_human_action = EXCLUDED.is_human_action,
                is_callback_action = EXCLUDED.is_callback_action,
                updated = EXCLUDED.updated
            "#,
        )
        .bind(action.id.as_str())
        .bind(action.workspace_id.as_str())
        .bind(action.flow_id.as_str())
        .bind(action.subflow_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(&action.subflow_name)
        .bind(&action.action_type)
        .bind(serde_json::Value::Object(action.action_params.clone()))
        .bind(encode_enum(&action.status)?)
        .bind(&action.result)
        .bind(action.is_human_action)
        .bind(action.is_callback_action)
        .bind(action.created)
        .bind(action.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_flow_action(
        &self,
        workspace_id: &Id,
        id: &Id,
    ) -> Result<FlowAction, StoreError> {
        let row = sqlx::query_as::<_, FlowActionRow>(
            "SELECT id, workspace_id, flow_id, subflow_id, subflow_name, action_type, \
             action_params, status, result, is_human_action, is_callback_action, created, updated \
             FROM flow_actions WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id.as_str())
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("flow action {id}")))?;
        row.into_action()
    }

    async fn list_flow_actions(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<FlowAction>, StoreError> {
        let rows = sqlx::query_as::<_, FlowActionRow>(
            "SELECT id, workspace_id, flow_id, subflow_id, subflow_name, action_type, \
             action_params, status, result, is_human_action, is_callback_action, created, updated \
             FROM flow_actions WHERE workspace_id = $1 AND flow_id = $2 ORDER BY seq",
        )
        .bind(workspace_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FlowActionRow::into_action).collect()
    }

    async fn delete_flow_actions_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flow_actions WHERE workspace_id = $1 AND flow_id = $2")
            .bind(workspace_id.as_str())
            .bind(flow_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn persist_worktree(&self, worktree: Worktree) -> Result<(), StoreError> {
        require_id(&worktree.id, "worktree id")?;
        require_id(&worktree.workspace_id, "workspace id")?;
        require_id(&worktree.flow_id, "flow id")?;
        sqlx::query(
            r#"
            INSERT INTO worktrees (id, workspace_id, flow_id, name, working_directory, created)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                working_directory = EXCLUDED.working_directory
            "#,
        )
        .bind(worktree.id.as_str())
        .bind(worktree.workspace_id.as_str())
        .bind(worktree.flow_id.as_str())
        .bind(&worktree.name)
        .bind(&worktree.working_directory)
        .bind(worktree.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_worktree(&self, workspace_id: &Id, id: &Id) -> Result<Worktree, StoreError> {
        let row = sqlx::query_as::<_, WorktreeRow>(
            "SELECT id, workspace_id, flow_id, name, working_directory, created \
             FROM worktrees WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id.as_str())
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("worktree {id}")))?;
        Ok(row.into_worktree())
    }

    async fn list_worktrees_by_workspace(
        &self,
        workspace_id: &Id,
    ) -> Result<Vec<Worktree>, StoreError> {
        let rows = sqlx::query_as::<_, WorktreeRow>(
            "SELECT id, workspace_id, flow_id, name, working_directory, created \
             FROM worktrees WHERE workspace_id = $1 ORDER BY id",
        )
        .bind(workspace_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WorktreeRow::into_worktree).collect())
    }

    async fn list_worktrees_by_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
    ) -> Result<Vec<Worktree>, StoreError> {
        let rows = sqlx::query_as::<_, WorktreeRow>(
            "SELECT id, workspace_id, flow_id, name, working_directory, created \
             FROM worktrees WHERE workspace_id = $1 AND flow_id = $2 ORDER BY id",
        )
        .bind(workspace_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WorktreeRow::into_worktree).collect())
    }

    async fn delete_worktree(&self, workspace_id: &Id, id: &Id) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM worktrees WHERE id = $1 AND workspace_id = $2")
            .bind(id.as_str())
            .bind(workspace_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn persist_provider_key(&self, key: ProviderKey) -> Result<(), StoreError> {
        key.validate()
            .map_err(|field| StoreError::Validation(format!("provider key missing {field}")))?;
        sqlx::query(
            r#"
            INSERT INTO provider_keys (id, provider_type, nickname, secret_manager_type,
                                       secret_name, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                provider_type = EXCLUDED.provider_type,
                nickname = EXCLUDED.nickname,
                secret_manager_type = EXCLUDED.secret_manager_type,
                secret_name = EXCLUDED.secret_name,
                updated = EXCLUDED.updated
            "#,
        )
        .bind(&key.id)
        .bind(&key.provider_type)
        .bind(&key.nickname)
        .bind(encode_enum(&key.secret_manager_type)?)
        .bind(&key.secret_name)
        .bind(key.created)
        .bind(key.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_provider_key(&self, id: &str) -> Result<ProviderKey, StoreError> {
        let row = sqlx::query_as::<_, ProviderKeyRow>(
            "SELECT id, provider_type, nickname, secret_manager_type, secret_name, created, updated \
             FROM provider_keys WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("provider key {id}")))?;
        row.into_key()
    }

    async fn list_provider_keys(&self) -> Result<Vec<ProviderKey>, StoreError> {
        let rows = sqlx::query_as::<_, ProviderKeyRow>(
            "SELECT id, provider_type, nickname, secret_manager_type, secret_name, created, updated \
             FROM provider_keys ORDER BY COALESCE(nickname, ''), id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProviderKeyRow::into_key).collect()
    }

    async fn delete_provider_key(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM provider_keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_codec() {
        assert_eq!(encode_enum(&TaskStatus::ToDo).unwrap(), "to_do");
        assert_eq!(
            decode_enum::<TaskStatus>("in_progress").unwrap(),
            TaskStatus::InProgress
        );
        assert!(decode_enum::<TaskStatus>("nope").is_err());
    }

    #[test]
    fn test_schema_covers_every_table() {
        for table in [
            "workspaces",
            "workspace_configs",
            "tasks",
            "flows",
            "subflows",
            "flow_actions",
            "worktrees",
            "provider_keys",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "schema missing {table}"
            );
        }
    }
}
