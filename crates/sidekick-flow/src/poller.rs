//! Failure sweeper: reconciles parent Task status with failed executions.
//!
//! A schedule runs per workspace. Each sweep asks the run-history store for
//! recently failed, timed-out or terminated executions and marks the
//! corresponding Task (when the execution's parent is a task) as `failed`.
//! Already-failed and archived tasks are left alone, so re-running a sweep
//! is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sidekick_domain::{prefixes, Id, TaskStatus};
use sidekick_storage::{Storage, StorageBackend};
use sidekick_streamer::{EventStreamer, StreamerBackend};

use crate::error::FlowError;
use crate::history::{RunHistoryStore, RunStatus};

const FAILURE_STATUSES: [RunStatus; 3] =
    [RunStatus::Failed, RunStatus::TimedOut, RunStatus::Terminated];

#[derive(Clone)]
pub struct FailurePoller {
    storage: StorageBackend,
    streamer: StreamerBackend,
    history: Arc<dyn RunHistoryStore>,
    interval: Duration,
    lookback: chrono::Duration,
}

impl FailurePoller {
    pub fn new(
        storage: StorageBackend,
        streamer: StreamerBackend,
        history: Arc<dyn RunHistoryStore>,
    ) -> Self {
        Self {
            storage,
            streamer,
            history,
            interval: Duration::from_secs(60),
            lookback: chrono::Duration::hours(24),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_lookback(mut self, lookback: chrono::Duration) -> Self {
        self.lookback = lookback;
        self
    }

    /// One sweep over a workspace. Returns how many tasks were marked failed.
    pub async fn sweep_workspace(&self, workspace_id: &Id) -> Result<u32, FlowError> {
        let since = Utc::now() - self.lookback;
        let executions = self
            .history
            .list_executions(workspace_id, &FAILURE_STATUSES, since)
            .await?;

        let mut updated = 0;
        for execution in executions {
            if !execution.parent_id.has_prefix(prefixes::TASK) {
                continue;
            }

            match self.storage.get_task(workspace_id, &execution.parent_id).await {
                Ok(mut task) => {
                    if task.status == TaskStatus::Failed || task.archived.is_some() {
                        continue;
                    }
                    info!(
                        task_id = %task.id,
                        flow_id = %execution.flow_id,
                        run_status = %execution.status,
                        "marking task failed after flow failure"
                    );
                    task.status = TaskStatus::Failed;
                    task.updated = Utc::now();
                    self.storage.persist_task(task.clone()).await?;
                    self.streamer.add_task_change(&task).await?;
                    updated += 1;
                }
                Err(err) if err.is_not_found() => {
                    debug!(parent_id = %execution.parent_id, "failed execution has no stored task");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(updated)
    }

    /// Install the periodic schedule for a workspace. A new schedule is
    /// installed whenever a workspace is created.
    pub fn spawn_schedule(&self, workspace_id: Id, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(%workspace_id, "failure sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                match poller.sweep_workspace(&workspace_id).await {
                    Ok(0) => {}
                    Ok(updated) => info!(%workspace_id, updated, "failure sweep reconciled tasks"),
                    Err(err) => warn!(%workspace_id, error = %err, "failure sweep failed"),
                }
            }
        })
    }
}
