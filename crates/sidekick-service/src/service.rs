//! Service wiring: backends, runtime, and per-workspace schedules.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sidekick_domain::{prefixes, ConfigMode, Id, Workspace};
use sidekick_flow::{FailurePoller, FlowRuntime, MemoryRunHistory};
use sidekick_storage::{Storage, StorageBackend, StoreError};
use sidekick_streamer::StreamerBackend;

use crate::config::{ServiceConfig, StorageKind, StreamerKind};

struct Schedule {
    cancel: CancellationToken,
    #[allow(dead_code)] // Held so the sweeper task is owned somewhere
    join: JoinHandle<()>,
}

/// Bundles the configured backends with the flow runtime and keeps the
/// per-workspace failure-sweeper schedules alive.
pub struct Service {
    storage: StorageBackend,
    streamer: StreamerBackend,
    runtime: FlowRuntime,
    poller: FailurePoller,
    schedules: Mutex<HashMap<Id, Schedule>>,
}

impl Service {
    pub async fn from_config(config: ServiceConfig) -> anyhow::Result<Self> {
        let storage = match &config.storage {
            StorageKind::Memory => StorageBackend::memory(),
            StorageKind::Postgres { database_url } => {
                StorageBackend::postgres(database_url).await?
            }
        };
        let streamer = match config.streamer {
            StreamerKind::Memory => StreamerBackend::memory(),
        };

        Ok(Self::new(storage, streamer))
    }

    pub fn new(storage: StorageBackend, streamer: StreamerBackend) -> Self {
        let history = Arc::new(MemoryRunHistory::new());
        let runtime = FlowRuntime::new(storage.clone(), streamer.clone(), history.clone());
        let poller = FailurePoller::new(storage.clone(), streamer.clone(), history);

        Self {
            storage,
            streamer,
            runtime,
            poller,
            schedules: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &StorageBackend {
        &self.storage
    }

    pub fn streamer(&self) -> &StreamerBackend {
        &self.streamer
    }

    pub fn runtime(&self) -> &FlowRuntime {
        &self.runtime
    }

    pub fn poller(&self) -> &FailurePoller {
        &self.poller
    }

    /// Create a workspace and install its failure-sweeper schedule.
    pub async fn create_workspace(
        &self,
        name: impl Into<String>,
        local_repo_dir: impl Into<String>,
        config_mode: ConfigMode,
    ) -> Result<Workspace, StoreError> {
        let now = Utc::now();
        let workspace = Workspace {
            id: Id::generate(prefixes::WORKSPACE),
            name: name.into(),
            local_repo_dir: local_repo_dir.into(),
            config_mode,
            created: now,
            updated: now,
        };
        self.storage.persist_workspace(workspace.clone()).await?;

        let cancel = CancellationToken::new();
        let join = self
            .poller
            .spawn_schedule(workspace.id.clone(), cancel.clone());
        self.schedules
            .lock()
            .insert(workspace.id.clone(), Schedule { cancel, join });

        info!(workspace_id = %workspace.id, name = %workspace.name, "workspace created");
        Ok(workspace)
    }

    /// Delete a workspace and stop its schedule.
    pub async fn delete_workspace(&self, workspace_id: &Id) -> Result<(), StoreError> {
        if let Some(schedule) = self.schedules.lock().remove(workspace_id) {
            schedule.cancel.cancel();
        }
        self.storage.delete_workspace(workspace_id).await
    }

    /// Stop every installed schedule (graceful shutdown).
    pub fn shutdown(&self) {
        for (_, schedule) in self.schedules.lock().drain() {
            schedule.cancel.cancel();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_workspace_installs_schedule() {
        let service = Service::new(StorageBackend::memory(), StreamerBackend::memory());

        let workspace = service
            .create_workspace("demo", "/tmp/demo", ConfigMode::Local)
            .await
            .unwrap();

        assert!(workspace.id.has_prefix(prefixes::WORKSPACE));
        assert!(service.schedules.lock().contains_key(&workspace.id));

        service.delete_workspace(&workspace.id).await.unwrap();
        assert!(!service.schedules.lock().contains_key(&workspace.id));

        let err = service
            .storage()
            .get_workspace(&workspace.id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_from_config_memory() {
        let config = ServiceConfig {
            storage: StorageKind::Memory,
            streamer: StreamerKind::Memory,
        };
        let service = Service::from_config(config).await.unwrap();
        assert!(service.storage().is_dev_mode());
    }
}
