//! In-memory event streamer.
//!
//! Sub-streams live in process memory; live delivery is driven by `watch`
//! version counters so pumps never spin while idle and never miss an append.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sidekick_domain::{FlowAction, FlowActionChange, FlowEvent, Id, Task};

use crate::streamer::{
    parse_start_id, EventStreamer, FlowEventEnvelope, FlowEventSubscription, StreamError,
};

const CHANNEL_CAPACITY: usize = 16;
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const IDLE_RECHECK: Duration = Duration::from_secs(1);

struct SubStream {
    entries: Vec<(u64, FlowEvent, Instant)>,
    next_offset: u64,
    ended: bool,
}

impl SubStream {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_offset: 1,
            ended: false,
        }
    }

    fn append(&mut self, event: FlowEvent, now: Instant, ttl: Duration) {
        self.entries.retain(|(_, _, added)| now.duration_since(*added) < ttl);
        let offset = self.next_offset;
        self.next_offset += 1;
        self.entries.push((offset, event, now));
    }
}

struct FlowHub {
    substreams: HashMap<Id, SubStream>,
}

struct HubHandle {
    hub: Mutex<FlowHub>,
    version: watch::Sender<u64>,
}

impl HubHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hub: Mutex::new(FlowHub {
                substreams: HashMap::new(),
            }),
            version: watch::channel(0).0,
        })
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

struct ChangeLog<T> {
    entries: Vec<(u64, T)>,
    next_offset: u64,
}

struct ChangeLogHandle<T> {
    log: Mutex<ChangeLog<T>>,
    version: watch::Sender<u64>,
}

impl<T: Clone + Send + 'static> ChangeLogHandle<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(ChangeLog {
                entries: Vec::new(),
                next_offset: 1,
            }),
            version: watch::channel(0).0,
        })
    }

    fn append(&self, record: T) {
        {
            let mut log = self.log.lock();
            let offset = log.next_offset;
            log.next_offset += 1;
            log.entries.push((offset, record));
        }
        self.version.send_modify(|v| *v += 1);
    }

    /// Pump records past `cursor` into `tx` until cancelled or the receiver
    /// goes away.
    fn spawn_pump(self: Arc<Self>, mut cursor: u64, cancel: CancellationToken, tx: mpsc::Sender<T>) {
        tokio::spawn(async move {
            let mut version = self.version.subscribe();
            loop {
                let pending: Vec<(u64, T)> = {
                    let log = self.log.lock();
                    log.entries
                        .iter()
                        .filter(|(offset, _)| *offset > cursor)
                        .cloned()
                        .collect()
                };

                for (offset, record) in pending {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(record) => {
                            if sent.is_err() {
                                return;
                            }
                            cursor = offset;
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = version.changed() => {}
                    _ = tokio::time::sleep(IDLE_RECHECK) => {}
                }
            }
        });
    }
}

/// In-memory implementation of the event streamer port.
pub struct MemoryStreamer {
    flows: Mutex<HashMap<(Id, Id), Arc<HubHandle>>>,
    action_changes: Mutex<HashMap<(Id, Id), Arc<ChangeLogHandle<FlowActionChange>>>>,
    task_changes: Mutex<HashMap<Id, Arc<ChangeLogHandle<Task>>>>,
    ttl: Duration,
}

impl Default for MemoryStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamer {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Construct with a custom retention window (tests use short ones).
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            action_changes: Mutex::new(HashMap::new()),
            task_changes: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn flow_hub(&self, workspace_id: &Id, flow_id: &Id) -> Arc<HubHandle> {
        self.flows
            .lock()
            .entry((workspace_id.clone(), flow_id.clone()))
            .or_insert_with(HubHandle::new)
            .clone()
    }

    fn action_log(&self, workspace_id: &Id, flow_id: &Id) -> Arc<ChangeLogHandle<FlowActionChange>> {
        self.action_changes
            .lock()
            .entry((workspace_id.clone(), flow_id.clone()))
            .or_insert_with(ChangeLogHandle::new)
            .clone()
    }

    fn task_log(&self, workspace_id: &Id) -> Arc<ChangeLogHandle<Task>> {
        self.task_changes
            .lock()
            .entry(workspace_id.clone())
            .or_insert_with(ChangeLogHandle::new)
            .clone()
    }
}

#[async_trait]
impl EventStreamer for MemoryStreamer {
    async fn add_flow_event(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        event: FlowEvent,
    ) -> Result<(), StreamError> {
        let handle = self.flow_hub(workspace_id, flow_id);
        let parent_id = event.parent_id().clone();
        {
            let mut hub = handle.hub.lock();
            let substream = hub
                .substreams
                .entry(parent_id.clone())
                .or_insert_with(SubStream::new);
            if substream.ended {
                debug!(%flow_id, %parent_id, "dropping event for ended sub-stream");
                return Ok(());
            }
            if event.is_end_stream() {
                substream.ended = true;
            }
            substream.append(event, Instant::now(), self.ttl);
        }
        handle.bump();
        Ok(())
    }

    async fn end_flow_event_stream(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        parent_id: &Id,
    ) -> Result<(), StreamError> {
        self.add_flow_event(
            workspace_id,
            flow_id,
            FlowEvent::EndStream {
                parent_id: parent_id.clone(),
            },
        )
        .await
    }

    async fn subscribe_flow_events(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        start_id: &str,
        mut parent_ids: mpsc::Receiver<Id>,
        cancel: CancellationToken,
    ) -> Result<FlowEventSubscription, StreamError> {
        let start = parse_start_id(start_id)?;
        let handle = self.flow_hub(workspace_id, flow_id);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut version = handle.version.subscribe();
            // parent id -> last delivered offset
            let mut active: HashMap<Id, u64> = HashMap::new();
            let mut order: Vec<Id> = Vec::new();
            let mut parents_open = true;

            loop {
                while let Ok(parent_id) = parent_ids.try_recv() {
                    if !active.contains_key(&parent_id) {
                        active.insert(parent_id.clone(), start);
                        order.push(parent_id);
                    }
                }

                // Collect deliverable events, FIFO per parent.
                let mut batch: Vec<(Id, u64, FlowEvent)> = Vec::new();
                let mut expired: Vec<(Id, u64)> = Vec::new();
                {
                    let hub = handle.hub.lock();
                    for parent_id in &order {
                        let Some(cursor) = active.get(parent_id) else {
                            continue;
                        };
                        let Some(substream) = hub.substreams.get(parent_id) else {
                            continue;
                        };
                        if let Some((first_offset, _, _)) = substream.entries.first() {
                            if *cursor + 1 < *first_offset {
                                expired.push((parent_id.clone(), first_offset - 1));
                            }
                        }
                        for (offset, event, _) in &substream.entries {
                            if offset > cursor {
                                batch.push((parent_id.clone(), *offset, event.clone()));
                            }
                        }
                    }
                }

                for (parent_id, fast_forward) in expired {
                    let _ = errors_tx
                        .send(StreamError::OffsetExpired(format!(
                            "{parent_id}@{fast_forward}"
                        )))
                        .await;
                    if let Some(cursor) = active.get_mut(&parent_id) {
                        if *cursor < fast_forward {
                            *cursor = fast_forward;
                        }
                    }
                }

                let mut delivered = false;
                for (parent_id, offset, event) in batch {
                    // The parent may have been dropped by an earlier
                    // end_stream in this same batch.
                    let Some(cursor) = active.get(&parent_id).copied() else {
                        continue;
                    };
                    if offset <= cursor {
                        continue;
                    }
                    let ended = event.is_end_stream();
                    let envelope = FlowEventEnvelope {
                        id: offset.to_string(),
                        event,
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = events_tx.send(envelope) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    delivered = true;
                    if ended {
                        active.remove(&parent_id);
                        order.retain(|p| p != &parent_id);
                    } else {
                        active.insert(parent_id, offset);
                    }
                }

                if delivered {
                    continue;
                }

                if parents_open {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = version.changed() => {}
                        _ = tokio::time::sleep(IDLE_RECHECK) => {}
                        received = parent_ids.recv() => match received {
                            Some(parent_id) => {
                                if !active.contains_key(&parent_id) {
                                    active.insert(parent_id.clone(), start);
                                    order.push(parent_id);
                                }
                            }
                            None => parents_open = false,
                        },
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = version.changed() => {}
                        _ = tokio::time::sleep(IDLE_RECHECK) => {}
                    }
                }
            }
        });

        Ok(FlowEventSubscription {
            events: events_rx,
            errors: errors_rx,
        })
    }

    async fn add_flow_action_change(&self, action: &FlowAction) -> Result<(), StreamError> {
        let log = self.action_log(&action.workspace_id, &action.flow_id);
        log.append(FlowActionChange::from(action));
        Ok(())
    }

    async fn subscribe_flow_action_changes(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        start_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FlowActionChange>, StreamError> {
        let cursor = parse_start_id(start_id)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.action_log(workspace_id, flow_id)
            .spawn_pump(cursor, cancel, tx);
        Ok(rx)
    }

    async fn add_task_change(&self, task: &Task) -> Result<(), StreamError> {
        self.task_log(&task.workspace_id).append(task.clone());
        Ok(())
    }

    async fn subscribe_task_changes(
        &self,
        workspace_id: &Id,
        start_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Task>, StreamError> {
        let cursor = parse_start_id(start_id)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.task_log(workspace_id).spawn_pump(cursor, cancel, tx);
        Ok(rx)
    }
}
