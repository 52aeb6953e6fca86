//! Flow execution context.
//!
//! A [`FlowContext`] is handed to every flow handler. All side effects go
//! through it: activities, recorded side effects (wall clock, fresh ids),
//! version gates, timers, and signal waits. Each observation is appended to
//! the run history, and on resumption the handler is re-executed against the
//! recorded history — recorded values are returned verbatim, so the handler
//! retraces its exact path before running live again.
//!
//! Handlers must be deterministic: no wall clock, randomness, or I/O outside
//! the context hooks. Suspension points are activity calls, signal waits and
//! timers; nothing else yields.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sidekick_domain::{Flow, FlowEvent, Id, UserResponse};
use sidekick_storage::StorageBackend;
use sidekick_streamer::{EventStreamer, StreamerBackend};

use crate::error::FlowError;
use crate::history::{RunEvent, RunHistoryStore};
use crate::retry::ActivityOptions;
use crate::state::{ChildRequest, FlowState, FlowStateRegistry};

pub(crate) struct ScopeFrame {
    pub subflow_id: Id,
    pub name: String,
}

/// Replay cursor over a flow's recorded history.
#[derive(Default)]
pub(crate) struct ReplayState {
    completed: HashMap<String, serde_json::Value>,
    failed: HashMap<String, (String, u32)>,
    recorded_effects: Vec<serde_json::Value>,
    effect_cursor: usize,
    versions: HashMap<String, u32>,
    signals: VecDeque<UserResponse>,
    fired_timers: HashSet<String>,
    activity_counters: HashMap<String, u32>,
    next_seq: u64,
}

impl ReplayState {
    pub(crate) fn from_events(events: &[RunEvent]) -> Self {
        let mut state = Self {
            next_seq: events.len() as u64,
            ..Self::default()
        };
        for event in events {
            match event {
                RunEvent::ActivityCompleted {
                    activity_id,
                    result,
                } => {
                    state.completed.insert(activity_id.clone(), result.clone());
                }
                RunEvent::ActivityFailed {
                    activity_id,
                    error,
                    attempts,
                } => {
                    state
                        .failed
                        .insert(activity_id.clone(), (error.clone(), *attempts));
                }
                RunEvent::SideEffect { value } => {
                    state.recorded_effects.push(value.clone());
                }
                RunEvent::VersionMarker { change_id, version } => {
                    state.versions.insert(change_id.clone(), *version);
                }
                RunEvent::SignalReceived { response } => {
                    state.signals.push_back(response.clone());
                }
                RunEvent::TimerFired { timer_id } => {
                    state.fired_timers.insert(timer_id.clone());
                }
                RunEvent::RunStarted { .. }
                | RunEvent::RunCompleted { .. }
                | RunEvent::RunFailed { .. }
                | RunEvent::RunCancelled { .. } => {}
            }
        }
        state
    }
}

pub(crate) struct ContextInner {
    pub(crate) flow: Flow,
    pub(crate) human_in_loop: bool,
    pub(crate) storage: StorageBackend,
    pub(crate) streamer: StreamerBackend,
    pub(crate) history: Arc<dyn RunHistoryStore>,
    pub(crate) state: Arc<FlowState>,
    pub(crate) registry: FlowStateRegistry,
    pub(crate) cancel: CancellationToken,
    pub(crate) replay: tokio::sync::Mutex<ReplayState>,
    pub(crate) scope: Mutex<Vec<ScopeFrame>>,
}

/// Execution context for one flow. Cheap to clone.
#[derive(Clone)]
pub struct FlowContext {
    pub(crate) inner: Arc<ContextInner>,
}

enum ActivityReplay {
    Completed(serde_json::Value),
    Failed(String, u32),
    Live(String),
}

impl FlowContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flow: Flow,
        human_in_loop: bool,
        storage: StorageBackend,
        streamer: StreamerBackend,
        history: Arc<dyn RunHistoryStore>,
        state: Arc<FlowState>,
        registry: FlowStateRegistry,
        replay: ReplayState,
    ) -> Self {
        let cancel = state.cancellation_token();
        Self {
            inner: Arc::new(ContextInner {
                flow,
                human_in_loop,
                storage,
                streamer,
                history,
                state,
                registry,
                cancel,
                replay: tokio::sync::Mutex::new(replay),
                scope: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn flow(&self) -> &Flow {
        &self.inner.flow
    }

    pub fn flow_id(&self) -> &Id {
        &self.inner.flow.id
    }

    pub fn workspace_id(&self) -> &Id {
        &self.inner.flow.workspace_id
    }

    pub fn human_in_loop(&self) -> bool {
        self.inner.human_in_loop
    }

    pub fn state(&self) -> &Arc<FlowState> {
        &self.inner.state
    }

    pub fn storage(&self) -> &StorageBackend {
        &self.inner.storage
    }

    pub fn streamer(&self) -> &StreamerBackend {
        &self.inner.streamer
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    // =========================================================================
    // History plumbing
    // =========================================================================

    pub(crate) async fn record(&self, event: RunEvent) -> Result<(), FlowError> {
        let mut replay = self.inner.replay.lock().await;
        let seq = replay.next_seq;
        let new_seq = self
            .inner
            .history
            .append_event(&self.inner.flow.id, seq, event)
            .await?;
        replay.next_seq = new_seq;
        Ok(())
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Execute a side-effecting activity with retry, timeout and replay.
    ///
    /// The body runs under the flow's cancellation token; transient failures
    /// are retried per `options.retry_policy` with exponential backoff.
    pub async fn activity<T, F, Fut>(
        &self,
        name: &str,
        options: ActivityOptions,
        body: F,
    ) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        self.activity_inner(name, options, body, false).await
    }

    /// Like [`FlowContext::activity`] but ignores flow cancellation. Used
    /// exclusively to persist terminal status rows during cleanup, so a
    /// cancelled flow is still observable as cancelled.
    pub async fn detached_activity<T, F, Fut>(
        &self,
        name: &str,
        options: ActivityOptions,
        body: F,
    ) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        self.activity_inner(name, options, body, true).await
    }

    async fn activity_inner<T, F, Fut>(
        &self,
        name: &str,
        options: ActivityOptions,
        body: F,
        detached: bool,
    ) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        let replayed = {
            let mut replay = self.inner.replay.lock().await;
            let counter = replay
                .activity_counters
                .entry(name.to_string())
                .or_insert(0);
            *counter += 1;
            let activity_id = format!("{name}#{counter}");

            if let Some(result) = replay.completed.get(&activity_id) {
                ActivityReplay::Completed(result.clone())
            } else if let Some((error, attempts)) = replay.failed.get(&activity_id) {
                ActivityReplay::Failed(error.clone(), *attempts)
            } else {
                ActivityReplay::Live(activity_id)
            }
        };

        let activity_id = match replayed {
            ActivityReplay::Completed(result) => {
                debug!(flow_id = %self.inner.flow.id, activity = name, "replaying recorded activity result");
                return Ok(serde_json::from_value(result)?);
            }
            ActivityReplay::Failed(error, attempts) => {
                return Err(FlowError::ActivityFailed {
                    activity: name.to_string(),
                    attempts,
                    message: error,
                });
            }
            ActivityReplay::Live(id) => id,
        };

        let mut attempt: u32 = 1;
        loop {
            if !detached && self.inner.cancel.is_cancelled() {
                return Err(FlowError::Canceled);
            }

            let outcome = if detached {
                body().await
            } else {
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => return Err(FlowError::Canceled),
                    timed = tokio::time::timeout(options.start_to_close_timeout, body()) => {
                        match timed {
                            Ok(result) => result,
                            Err(_) => Err(FlowError::transient(format!(
                                "activity {name} timed out after {:?}",
                                options.start_to_close_timeout
                            ))),
                        }
                    }
                }
            };

            match outcome {
                Ok(value) => {
                    let encoded = serde_json::to_value(&value)?;
                    self.record(RunEvent::ActivityCompleted {
                        activity_id: activity_id.clone(),
                        result: encoded.clone(),
                    })
                    .await?;
                    let mut replay = self.inner.replay.lock().await;
                    replay.completed.insert(activity_id, encoded);
                    return Ok(value);
                }
                Err(err) if err.is_passthrough() => return Err(err),
                Err(err)
                    if err.is_retryable()
                        && options.retry_policy.has_attempts_remaining(attempt) =>
                {
                    let delay = options.retry_policy.delay_for_attempt(attempt + 1);
                    warn!(
                        flow_id = %self.inner.flow.id,
                        activity = name,
                        attempt,
                        ?delay,
                        error = %err,
                        "activity failed, retrying"
                    );
                    attempt += 1;
                    if detached {
                        tokio::time::sleep(delay).await;
                    } else {
                        tokio::select! {
                            _ = self.inner.cancel.cancelled() => return Err(FlowError::Canceled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(err) => {
                    self.record(RunEvent::ActivityFailed {
                        activity_id: activity_id.clone(),
                        error: err.to_string(),
                        attempts: attempt,
                    })
                    .await?;
                    let message = err.to_string();
                    let mut replay = self.inner.replay.lock().await;
                    replay.failed.insert(activity_id, (message.clone(), attempt));
                    return Err(FlowError::ActivityFailed {
                        activity: name.to_string(),
                        attempts: attempt,
                        message,
                    });
                }
            }
        }
    }

    // =========================================================================
    // Recorded non-determinism
    // =========================================================================

    /// Obtain a non-deterministic value through the recorded side-effect
    /// hook. During replay the recorded value is returned and `f` never runs.
    pub async fn side_effect<T, F>(&self, f: F) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let mut replay = self.inner.replay.lock().await;
        if replay.effect_cursor < replay.recorded_effects.len() {
            let value = replay.recorded_effects[replay.effect_cursor].clone();
            replay.effect_cursor += 1;
            return Ok(serde_json::from_value(value)?);
        }

        let value = f();
        let encoded = serde_json::to_value(&value)?;
        let seq = replay.next_seq;
        let new_seq = self
            .inner
            .history
            .append_event(
                &self.inner.flow.id,
                seq,
                RunEvent::SideEffect {
                    value: encoded.clone(),
                },
            )
            .await?;
        replay.next_seq = new_seq;
        replay.recorded_effects.push(encoded);
        replay.effect_cursor += 1;
        Ok(value)
    }

    /// Replay-safe wall clock (UTC).
    pub async fn now(&self) -> Result<DateTime<Utc>, FlowError> {
        self.side_effect(Utc::now).await
    }

    /// Replay-safe id allocation.
    pub async fn new_id(&self, prefix: &str) -> Result<Id, FlowError> {
        let prefix = prefix.to_string();
        self.side_effect(move || Id::generate(&prefix)).await
    }

    /// Behavior-version gate.
    ///
    /// The first execution records `max_supported` and takes the new code
    /// path; replays return whatever was recorded so an already-running flow
    /// keeps the behavior it started with. A recorded version below
    /// `min_supported` means the running history predates what this build
    /// can still execute.
    pub async fn version(
        &self,
        change_id: &str,
        min_supported: u32,
        max_supported: u32,
    ) -> Result<u32, FlowError> {
        {
            let replay = self.inner.replay.lock().await;
            if let Some(recorded) = replay.versions.get(change_id) {
                if *recorded < min_supported {
                    return Err(FlowError::Fatal(format!(
                        "flow {} recorded version {recorded} of {change_id}, below supported minimum {min_supported}",
                        self.inner.flow.id
                    )));
                }
                return Ok(*recorded);
            }
        }

        self.record(RunEvent::VersionMarker {
            change_id: change_id.to_string(),
            version: max_supported,
        })
        .await?;
        let mut replay = self.inner.replay.lock().await;
        replay
            .versions
            .insert(change_id.to_string(), max_supported);
        Ok(max_supported)
    }

    /// Replay-safe timer. Already-fired timers return immediately on replay.
    pub async fn timer(
        &self,
        timer_id: &str,
        duration: std::time::Duration,
    ) -> Result<(), FlowError> {
        {
            let replay = self.inner.replay.lock().await;
            if replay.fired_timers.contains(timer_id) {
                return Ok(());
            }
        }

        tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(FlowError::Canceled),
            _ = tokio::time::sleep(duration) => {}
        }

        self.record(RunEvent::TimerFired {
            timer_id: timer_id.to_string(),
        })
        .await?;
        let mut replay = self.inner.replay.lock().await;
        replay.fired_timers.insert(timer_id.to_string());
        Ok(())
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Block until a user response is delivered to this flow.
    pub async fn wait_for_user_response(&self) -> Result<UserResponse, FlowError> {
        self.wait_for_user_response_inner(true).await
    }

    pub(crate) async fn wait_for_user_response_inner(
        &self,
        allow_preemption: bool,
    ) -> Result<UserResponse, FlowError> {
        {
            let mut replay = self.inner.replay.lock().await;
            if let Some(response) = replay.signals.pop_front() {
                return Ok(response);
            }
        }

        match self
            .inner
            .state
            .next_response(allow_preemption, &self.inner.cancel)
            .await
        {
            Some(Ok(response)) => {
                self.record(RunEvent::SignalReceived {
                    response: response.clone(),
                })
                .await?;
                Ok(response)
            }
            Some(Err(action)) => Err(FlowError::PendingAction(action)),
            None => Err(FlowError::Canceled),
        }
    }

    // =========================================================================
    // Flow events
    // =========================================================================

    /// Publish a flow event, recorded as an activity so replays do not
    /// re-emit it.
    pub async fn publish_event(&self, event: FlowEvent) -> Result<(), FlowError> {
        self.publish_event_inner(event, false).await
    }

    pub(crate) async fn publish_event_inner(
        &self,
        event: FlowEvent,
        detached: bool,
    ) -> Result<(), FlowError> {
        let streamer = self.inner.streamer.clone();
        let workspace_id = self.inner.flow.workspace_id.clone();
        let flow_id = self.inner.flow.id.clone();
        let body = move || {
            let streamer = streamer.clone();
            let workspace_id = workspace_id.clone();
            let flow_id = flow_id.clone();
            let event = event.clone();
            async move {
                streamer
                    .add_flow_event(&workspace_id, &flow_id, event)
                    .await
                    .map_err(FlowError::from)
            }
        };
        if detached {
            self.detached_activity("publish_flow_event", ActivityOptions::no_retry(), body)
                .await
        } else {
            self.activity("publish_flow_event", ActivityOptions::no_retry(), body)
                .await
        }
    }

    /// Publish a progress line parented at the current scope (the innermost
    /// subflow, or the flow itself).
    pub async fn progress(&self, text: impl Into<String>) -> Result<(), FlowError> {
        let parent = self
            .current_subflow_id()
            .unwrap_or_else(|| self.inner.flow.id.clone());
        self.publish_event(FlowEvent::progress(parent, text.into()))
            .await
    }

    /// Publish a partial LLM message keyed by the flow action emitting it.
    /// Order of deltas within one action is authoritative for the UI.
    pub async fn publish_chat_delta(
        &self,
        flow_action_id: &Id,
        delta: sidekick_domain::ChatMessageDelta,
    ) -> Result<(), FlowError> {
        self.publish_event(FlowEvent::ChatMessageDelta {
            flow_action_id: flow_action_id.clone(),
            delta,
        })
        .await
    }

    /// Record an isolated checkout for this flow.
    pub async fn create_worktree(
        &self,
        branch: impl Into<String>,
        working_directory: impl Into<String>,
    ) -> Result<sidekick_domain::Worktree, FlowError> {
        let worktree = sidekick_domain::Worktree {
            id: self.new_id(sidekick_domain::prefixes::WORKTREE).await?,
            workspace_id: self.inner.flow.workspace_id.clone(),
            flow_id: self.inner.flow.id.clone(),
            name: branch.into(),
            working_directory: working_directory.into(),
            created: self.now().await?,
        };

        let storage = self.inner.storage.clone();
        let persisted = worktree.clone();
        self.activity("persist_worktree", ActivityOptions::default(), move || {
            let storage = storage.clone();
            let worktree = persisted.clone();
            async move {
                sidekick_storage::Storage::persist_worktree(&storage, worktree)
                    .await
                    .map_err(FlowError::from)
            }
        })
        .await?;

        Ok(worktree)
    }

    /// Route a user-interaction request to the parent workflow, if the
    /// parent is a flow running in this process.
    pub(crate) fn state_registry_notify_parent(&self, request: ChildRequest) {
        let parent_id = &self.inner.flow.parent_id;
        if !parent_id.has_prefix(sidekick_domain::prefixes::FLOW) {
            return;
        }
        if let Some(parent_state) = self.inner.registry.get(parent_id) {
            parent_state.push_child_request(request);
        }
    }

    // =========================================================================
    // Scope
    // =========================================================================

    pub(crate) fn push_scope(&self, frame: ScopeFrame) {
        self.inner.scope.lock().push(frame);
    }

    pub(crate) fn pop_scope(&self) {
        self.inner.scope.lock().pop();
    }

    /// The innermost open subflow, if any.
    pub fn current_subflow_id(&self) -> Option<Id> {
        self.inner.scope.lock().last().map(|f| f.subflow_id.clone())
    }

    /// Legacy `:|:`-joined scope path for UI versions predating the subflow
    /// model.
    pub fn scope_path(&self) -> String {
        self.inner
            .scope
            .lock()
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(":|:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{FlowExecution, MemoryRunHistory, RunStatus};
    use crate::state::FlowStateRegistry;
    use sidekick_domain::{prefixes, FlowStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn context_over(history: Arc<MemoryRunHistory>, flow_id: &Id) -> FlowContext {
        let flow = Flow {
            id: flow_id.clone(),
            workspace_id: Id::generate(prefixes::WORKSPACE),
            flow_type: "test".to_string(),
            parent_id: Id::generate(prefixes::TASK),
            status: FlowStatus::Running,
        };
        history
            .create_execution(FlowExecution {
                flow_id: flow.id.clone(),
                workspace_id: flow.workspace_id.clone(),
                parent_id: flow.parent_id.clone(),
                flow_type: flow.flow_type.clone(),
                status: RunStatus::Running,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let events = history.load_events(flow_id).await.unwrap();
        let registry = FlowStateRegistry::new();
        let state = registry.get_or_create(flow_id);
        FlowContext::new(
            flow,
            true,
            sidekick_storage::StorageBackend::memory(),
            sidekick_streamer::StreamerBackend::memory(),
            history,
            state,
            registry,
            ReplayState::from_events(&events),
        )
    }

    #[tokio::test]
    async fn test_side_effects_replay_in_order() {
        let history = Arc::new(MemoryRunHistory::new());
        let flow_id = Id::generate(prefixes::FLOW);

        let ctx = context_over(history.clone(), &flow_id).await;
        let first_id = ctx.new_id(prefixes::FLOW_ACTION).await.unwrap();
        let stamp = ctx.now().await.unwrap();

        // A second context over the same history replays the recorded
        // values without re-generating them.
        let replayed = context_over(history, &flow_id).await;
        assert_eq!(replayed.new_id(prefixes::FLOW_ACTION).await.unwrap(), first_id);
        assert_eq!(replayed.now().await.unwrap(), stamp);
    }

    #[tokio::test]
    async fn test_activity_result_replays_without_rerun() {
        let history = Arc::new(MemoryRunHistory::new());
        let flow_id = Id::generate(prefixes::FLOW);
        let runs = Arc::new(AtomicU32::new(0));

        let ctx = context_over(history.clone(), &flow_id).await;
        let runs_live = runs.clone();
        let value: u32 = ctx
            .activity("compute", ActivityOptions::default(), move || {
                let runs = runs_live.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let replayed = context_over(history, &flow_id).await;
        let runs_replay = runs.clone();
        let value: u32 = replayed
            .activity("compute", ActivityOptions::default(), move || {
                let runs = runs_replay.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activity_retries_transient_errors() {
        let history = Arc::new(MemoryRunHistory::new());
        let flow_id = Id::generate(prefixes::FLOW);
        let runs = Arc::new(AtomicU32::new(0));

        let ctx = context_over(history, &flow_id).await;
        let runs_in_body = runs.clone();
        let options = ActivityOptions::default().with_retry(
            crate::retry::RetryPolicy::fixed(std::time::Duration::from_millis(1), 3),
        );
        let value: String = ctx
            .activity("wobbly", options, move || {
                let runs = runs_in_body.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FlowError::transient("flaky backend"))
                    } else {
                        Ok("settled".to_string())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "settled");
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_fail_fast() {
        let history = Arc::new(MemoryRunHistory::new());
        let flow_id = Id::generate(prefixes::FLOW);
        let runs = Arc::new(AtomicU32::new(0));

        let ctx = context_over(history, &flow_id).await;
        let runs_in_body = runs.clone();
        let result: Result<(), _> = ctx
            .activity("strict", ActivityOptions::default(), move || {
                let runs = runs_in_body.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err(FlowError::non_retryable("bad input"))
                }
            })
            .await;

        assert!(matches!(result, Err(FlowError::ActivityFailed { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_version_gate_records_then_replays() {
        let history = Arc::new(MemoryRunHistory::new());
        let flow_id = Id::generate(prefixes::FLOW);

        let ctx = context_over(history.clone(), &flow_id).await;
        assert_eq!(ctx.version("new-behavior", 0, 2).await.unwrap(), 2);
        // Same run, same change id: the recorded decision holds.
        assert_eq!(ctx.version("new-behavior", 0, 3).await.unwrap(), 2);

        let replayed = context_over(history, &flow_id).await;
        assert_eq!(replayed.version("new-behavior", 0, 5).await.unwrap(), 2);

        // A history recorded below the supported minimum is unrunnable.
        let err = replayed.version("new-behavior", 3, 5).await.unwrap_err();
        assert!(matches!(err, FlowError::Fatal(_)));
    }
}
