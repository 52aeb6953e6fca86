//! Event streamer port trait definition

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sidekick_domain::{FlowAction, FlowActionChange, FlowEvent, Id, Task};

/// Error type for streamer operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Backend or network failure.
    #[error("stream transport error: {0}")]
    Transport(String),

    /// Encoding or decoding of a streamed record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The requested start offset is no longer retained.
    #[error("start offset {0} expired")]
    OffsetExpired(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A delivered flow event plus its position in the parent sub-stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEventEnvelope {
    /// Offset within the (workspace, flow, parent) sub-stream, as an opaque
    /// string usable as the next subscription's `start_id`.
    pub id: String,
    pub event: FlowEvent,
}

/// Live subscription handle. Dropping the receivers (or cancelling the token
/// passed at subscribe time) tears the pump down.
pub struct FlowEventSubscription {
    pub events: mpsc::Receiver<FlowEventEnvelope>,
    pub errors: mpsc::Receiver<StreamError>,
}

/// Ordered, append-only, subscribable log of flow events and change records.
///
/// Sub-streams are keyed by (workspace, flow, parent-id) and are strictly
/// FIFO; nothing is promised across sub-streams. Event channels are
/// small-buffered: a slow consumer blocks the producer, and nothing is
/// dropped silently.
#[async_trait]
pub trait EventStreamer: Send + Sync + 'static {
    /// Append an event to its parent sub-stream. Appending after the
    /// sub-stream ended is silently ignored. Entries expire after roughly a
    /// day.
    async fn add_flow_event(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        event: FlowEvent,
    ) -> Result<(), StreamError>;

    /// Publish the `end_stream` sentinel for a parent and close its
    /// sub-stream.
    async fn end_flow_event_stream(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        parent_id: &Id,
    ) -> Result<(), StreamError>;

    /// Subscribe to a dynamically changing set of parent sub-streams.
    ///
    /// `start_id` of `"0"` replays from the beginning; otherwise it is the
    /// envelope id of the last event already seen. Parents arrive over
    /// `parent_ids`; with no parents subscribed the pump blocks (it does not
    /// spin). After a parent's `end_stream` is delivered the parent is
    /// dropped from the active set. Cancelling `cancel` terminates all
    /// produced channels within a bounded time.
    async fn subscribe_flow_events(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        start_id: &str,
        parent_ids: mpsc::Receiver<Id>,
        cancel: CancellationToken,
    ) -> Result<FlowEventSubscription, StreamError>;

    /// Publish a FlowAction change record onto its flow's change stream.
    async fn add_flow_action_change(&self, action: &FlowAction) -> Result<(), StreamError>;

    /// Subscribe to a flow's FlowAction change stream from `start_id`.
    async fn subscribe_flow_action_changes(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        start_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FlowActionChange>, StreamError>;

    /// Publish a Task change onto its workspace's change stream.
    async fn add_task_change(&self, task: &Task) -> Result<(), StreamError>;

    /// Subscribe to a workspace's Task change stream from `start_id`.
    async fn subscribe_task_changes(
        &self,
        workspace_id: &Id,
        start_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Task>, StreamError>;
}

/// Parse a subscription start id: `"0"` (or empty) means from the beginning.
pub(crate) fn parse_start_id(start_id: &str) -> Result<u64, StreamError> {
    if start_id.is_empty() || start_id == "0" {
        return Ok(0);
    }
    start_id
        .parse::<u64>()
        .map_err(|_| StreamError::OffsetExpired(start_id.to_string()))
}
