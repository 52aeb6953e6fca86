//! Flow runtime: drives registered flow handlers to a terminal state.
//!
//! One execution per Flow, identified by the Flow id. A handler is an async
//! function over a [`FlowContext`]; on `resume_flow` the handler re-executes
//! against the recorded run history and retraces its path deterministically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use sidekick_domain::{Flow, FlowStatus, Id, PendingUserAction, UserResponse};
use sidekick_storage::{Storage, StorageBackend};
use sidekick_streamer::{EventStreamer, StreamerBackend};

use crate::context::{FlowContext, ReplayState};
use crate::error::FlowError;
use crate::history::{FlowExecution, RunEvent, RunHistoryStore, RunStatus};
use crate::state::FlowStateRegistry;

type FlowHandler =
    Arc<dyn Fn(FlowContext) -> BoxFuture<'static, Result<serde_json::Value, FlowError>> + Send + Sync>;

/// Handle to a spawned flow execution.
pub struct FlowHandle {
    pub flow_id: Id,
    pub join: JoinHandle<Result<serde_json::Value, FlowError>>,
}

struct RuntimeInner {
    storage: StorageBackend,
    streamer: StreamerBackend,
    history: Arc<dyn RunHistoryStore>,
    handlers: RwLock<HashMap<String, FlowHandler>>,
    states: FlowStateRegistry,
}

/// The workflow runtime adapter.
#[derive(Clone)]
pub struct FlowRuntime {
    inner: Arc<RuntimeInner>,
}

impl FlowRuntime {
    pub fn new(
        storage: StorageBackend,
        streamer: StreamerBackend,
        history: Arc<dyn RunHistoryStore>,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                storage,
                streamer,
                history,
                handlers: RwLock::new(HashMap::new()),
                states: FlowStateRegistry::new(),
            }),
        }
    }

    /// Register a handler for a flow type.
    pub fn register<F, Fut>(&self, flow_type: &str, handler: F)
    where
        F: Fn(FlowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, FlowError>> + Send + 'static,
    {
        let handler: FlowHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.inner
            .handlers
            .write()
            .insert(flow_type.to_string(), handler);
        info!(flow_type, "registered flow handler");
    }

    /// The per-flow control-surface registry. Out-of-band signal handlers
    /// (the HTTP API) reach running flows through this.
    pub fn states(&self) -> FlowStateRegistry {
        self.inner.states.clone()
    }

    pub fn history(&self) -> Arc<dyn RunHistoryStore> {
        self.inner.history.clone()
    }

    pub fn storage(&self) -> &StorageBackend {
        &self.inner.storage
    }

    pub fn streamer(&self) -> &StreamerBackend {
        &self.inner.streamer
    }

    fn handler_for(&self, flow_type: &str) -> Result<FlowHandler, FlowError> {
        self.inner
            .handlers
            .read()
            .get(flow_type)
            .cloned()
            .ok_or_else(|| FlowError::Fatal(format!("no handler registered for flow type {flow_type:?}")))
    }

    /// Start a new flow execution.
    #[instrument(skip(self, flow), fields(flow_id = %flow.id, flow_type = %flow.flow_type))]
    pub async fn start_flow(
        &self,
        flow: Flow,
        human_in_loop: bool,
    ) -> Result<FlowHandle, FlowError> {
        let handler = self.handler_for(&flow.flow_type)?;

        self.inner.storage.persist_flow(flow.clone()).await?;
        self.inner
            .history
            .create_execution(FlowExecution {
                flow_id: flow.id.clone(),
                workspace_id: flow.workspace_id.clone(),
                parent_id: flow.parent_id.clone(),
                flow_type: flow.flow_type.clone(),
                status: RunStatus::Running,
                updated_at: Utc::now(),
            })
            .await?;

        let start_event = RunEvent::RunStarted {
            input: serde_json::to_value(&flow)?,
        };
        self.inner
            .history
            .append_event(&flow.id, 0, start_event.clone())
            .await?;

        info!("starting flow");
        self.spawn(flow, human_in_loop, handler, ReplayState::from_events(&[start_event]))
    }

    /// Resume a flow execution by replaying its recorded history.
    #[instrument(skip(self))]
    pub async fn resume_flow(
        &self,
        workspace_id: &Id,
        flow_id: &Id,
        human_in_loop: bool,
    ) -> Result<FlowHandle, FlowError> {
        let flow = self.inner.storage.get_flow(workspace_id, flow_id).await?;
        let handler = self.handler_for(&flow.flow_type)?;
        let events = self.inner.history.load_events(flow_id).await?;

        self.inner
            .history
            .update_execution_status(flow_id, RunStatus::Running)
            .await?;

        info!(recorded_events = events.len(), "resuming flow from history");
        self.spawn(flow, human_in_loop, handler, ReplayState::from_events(&events))
    }

    fn spawn(
        &self,
        flow: Flow,
        human_in_loop: bool,
        handler: FlowHandler,
        replay: ReplayState,
    ) -> Result<FlowHandle, FlowError> {
        let flow_id = flow.id.clone();
        let state = self.inner.states.get_or_create(&flow_id);
        let ctx = FlowContext::new(
            flow,
            human_in_loop,
            self.inner.storage.clone(),
            self.inner.streamer.clone(),
            self.inner.history.clone(),
            state,
            self.inner.states.clone(),
            replay,
        );

        let runtime = self.clone();
        let join = tokio::spawn(async move { runtime.drive(ctx, handler).await });
        Ok(FlowHandle { flow_id, join })
    }

    /// Run the handler and write the terminal bookkeeping: run-history
    /// terminal event, execution status, stored flow status, and the
    /// `end_stream` sentinel for the flow's own sub-stream.
    async fn drive(
        &self,
        ctx: FlowContext,
        handler: FlowHandler,
    ) -> Result<serde_json::Value, FlowError> {
        let flow_id = ctx.flow_id().clone();
        let workspace_id = ctx.workspace_id().clone();

        let result = handler(ctx.clone()).await;

        match &result {
            Ok(value) => {
                info!(%flow_id, "flow completed");
                if let Err(err) = ctx
                    .record(RunEvent::RunCompleted {
                        result: value.clone(),
                    })
                    .await
                {
                    warn!(%flow_id, error = %err, "failed to record completion event");
                }
                let _ = self
                    .inner
                    .history
                    .update_execution_status(&flow_id, RunStatus::Completed)
                    .await;
                self.persist_terminal_flow_status(&ctx, FlowStatus::Complete)
                    .await;
            }
            Err(err) if matches!(err, FlowError::Canceled | FlowError::PendingAction(_)) => {
                warn!(%flow_id, reason = %err, "flow cancelled");
                if let Err(record_err) = ctx
                    .record(RunEvent::RunCancelled {
                        reason: err.to_string(),
                    })
                    .await
                {
                    warn!(%flow_id, error = %record_err, "failed to record cancellation event");
                }
                let _ = self
                    .inner
                    .history
                    .update_execution_status(&flow_id, RunStatus::Cancelled)
                    .await;
                // The stored flow status is left for the failure sweeper and
                // callers to reconcile; cancellation is not a failure.
            }
            Err(err) => {
                error!(%flow_id, error = %err, "flow failed");
                if let Err(record_err) = ctx
                    .record(RunEvent::RunFailed {
                        error: err.to_string(),
                    })
                    .await
                {
                    warn!(%flow_id, error = %record_err, "failed to record failure event");
                }
                let _ = self
                    .inner
                    .history
                    .update_execution_status(&flow_id, RunStatus::Failed)
                    .await;
                self.persist_terminal_flow_status(&ctx, FlowStatus::Failed)
                    .await;
            }
        }

        if let Err(err) = self
            .inner
            .streamer
            .end_flow_event_stream(&workspace_id, &flow_id, &flow_id)
            .await
        {
            warn!(%flow_id, error = %err, "failed to end flow event stream");
        }

        result
    }

    /// Terminal flow-status write, outside the deterministic section. Best
    /// effort: the run history already carries the authoritative outcome.
    async fn persist_terminal_flow_status(&self, ctx: &FlowContext, status: FlowStatus) {
        let mut flow = ctx.flow().clone();
        flow.status = status;
        if let Err(err) = self.inner.storage.persist_flow(flow).await {
            warn!(flow_id = %ctx.flow_id(), error = %err, "failed to persist terminal flow status");
        }
    }

    // =========================================================================
    // Out-of-band signals
    // =========================================================================

    /// Route an inbound user response to the flow whose id matches
    /// `target_workflow_id`.
    pub fn signal_user_response(&self, response: UserResponse) -> Result<(), FlowError> {
        let state = self
            .inner
            .states
            .get(&response.target_workflow_id)
            .ok_or_else(|| FlowError::UnknownFlow(response.target_workflow_id.clone()))?;
        state.push_response(response);
        Ok(())
    }

    /// Queue an out-of-band user action (e.g. "go to the next step") against
    /// a running flow.
    pub fn queue_pending_action(
        &self,
        flow_id: &Id,
        action: PendingUserAction,
    ) -> Result<(), FlowError> {
        let state = self
            .inner
            .states
            .get(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.clone()))?;
        state.push_pending_action(action);
        Ok(())
    }

    /// Toggle a running flow's paused flag.
    pub fn set_paused(&self, flow_id: &Id, paused: bool) -> Result<(), FlowError> {
        let state = self
            .inner
            .states
            .get(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.clone()))?;
        state.set_paused(paused);
        Ok(())
    }

    /// Cancel a running flow: fire every registered cancel-func, abort
    /// outstanding activity waits, and let the driving task finalize
    /// terminal rows on the detached path.
    pub fn cancel_flow(&self, flow_id: &Id) -> Result<(), FlowError> {
        let state = self
            .inner
            .states
            .get(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.clone()))?;
        state.cancel_all();
        Ok(())
    }
}
