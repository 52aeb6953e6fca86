// Streamer backend abstraction
// Decision: Use enum dispatch for simplicity over trait objects

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sidekick_domain::{FlowAction, FlowEvent, Id, Task};

use crate::memory::MemoryStreamer;
use crate::streamer::{EventStreamer, FlowEventSubscription, StreamError};

/// Streamer backend selected at startup. The streamer backend is chosen
/// independently of the storage backend.
#[derive(Clone)]
pub enum StreamerBackend {
    Memory(Arc<MemoryStreamer>),
}

impl StreamerBackend {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryStreamer::new()))
    }
}

#[async_trait]
impl EventStreamer for StreamerBackend {
    async fn add_flow_event(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        event: FlowEvent,
    ) -> Result<(), StreamError> {
        match self {
            Self::Memory(s) => s.add_flow_event(workspace_id, flow_id, event).await,
        }
    }

    async fn end_flow_event_stream(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        parent_id: &Id,
    ) -> Result<(), StreamError> {
        match self {
            Self::Memory(s) => s.end_flow_event_stream(workspace_id, flow_id, parent_id).await,
        }
    }

    async fn subscribe_flow_events(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        start_id: &str,
        parent_ids: mpsc::Receiver<Id>,
        cancel: CancellationToken,
    ) -> Result<FlowEventSubscription, StreamError> {
        match self {
            Self::Memory(s) => {
                s.subscribe_flow_events(workspace_id, flow_id, start_id, parent_ids, cancel)
                    .await
            }
        }
    }

    async fn add_flow_action_change(&self, action: &FlowAction) -> Result<(), StreamError> {
        match self {
            Self::Memory(s) => s.add_flow_action_change(action).await,
        }
    }

    async fn subscribe_flow_action_changes(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        start_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<sidekick_domain::FlowActionChange>, StreamError> {
        match self {
            Self::Memory(s) => {
                s.subscribe_flow_action_changes(workspace_id, flow_id, start_id, cancel)
                    .await
            }
        }
    }

    async fn add_task_change(&self, task: &Task) -> Result<(), StreamError> {
        match self {
            Self::Memory(s) => s.add_task_change(task).await,
        }
    }

    async fn subscribe_task_changes(
        &self,
        workspace_id: &Id,
        start_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Task>, StreamError> {
        match self {
            Self::Memory(s) => s.subscribe_task_changes(workspace_id, start_id, cancel).await,
        }
    }
}
