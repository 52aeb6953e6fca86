//! Action tracking: every unit of flow work becomes a persisted FlowAction
//! (or Subflow) with start and terminal rows.
//!
//! Persists run through the activity machinery so they are recorded in the
//! run history and replay exactly-once. Terminal rows for failed or
//! cancelled work run on the detached path, so they are written even when
//! the flow's cancellation token has already fired.

use serde::Serialize;
use std::future::Future;

use sidekick_domain::{prefixes, ActionStatus, FlowAction, FlowEvent, Subflow, SubflowStatus};
use sidekick_storage::Storage;
use sidekick_streamer::EventStreamer;

use crate::context::{FlowContext, ScopeFrame};
use crate::error::FlowError;
use crate::retry::ActivityOptions;
use crate::versions;

fn canceled_note(err: &FlowError) -> Option<String> {
    match err {
        FlowError::PendingAction(action) => {
            Some(format!("canceled: pending user action {}", action.action_type))
        }
        FlowError::Canceled => Some("canceled: flow canceled".to_string()),
        _ => None,
    }
}

impl FlowContext {
    // =========================================================================
    // FlowAction trackers
    // =========================================================================

    /// Track a unit of work: a `started` row before the body, a terminal row
    /// after (`complete` with the JSON-encoded return value, `failed` with
    /// the error message).
    pub async fn track<T, F, Fut>(
        &self,
        action_type: &str,
        params: serde_json::Map<String, serde_json::Value>,
        body: F,
    ) -> Result<T, FlowError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        let action = self
            .new_flow_action(action_type, params, ActionStatus::Started, false, false)
            .await?;
        self.persist_action(&action, false).await?;

        let outcome = body().await;
        self.finalize_action(action, outcome).await
    }

    /// Run the body first and only persist a row if it failed. Used for
    /// frequent low-value actions. The failure row's change record is
    /// published the same way `track`'s is.
    pub async fn track_failure_only<T, F, Fut>(
        &self,
        action_type: &str,
        params: serde_json::Map<String, serde_json::Value>,
        body: F,
    ) -> Result<T, FlowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        match body().await {
            Ok(value) => Ok(value),
            Err(err) => {
                let mut action = self
                    .new_flow_action(action_type, params, ActionStatus::Failed, false, false)
                    .await?;
                action.result = canceled_note(&err).unwrap_or_else(|| err.to_string());
                self.persist_action(&action, true).await?;
                Err(err)
            }
        }
    }

    /// Persist a `pending` human-action row. The returned action is
    /// completed later by [`FlowContext::complete_human_action`] once the
    /// user responds.
    pub async fn track_human(
        &self,
        action_type: &str,
        params: serde_json::Map<String, serde_json::Value>,
        is_callback: bool,
    ) -> Result<FlowAction, FlowError> {
        let mut action = self
            .new_flow_action(action_type, params, ActionStatus::Pending, true, is_callback)
            .await?;
        // The UI resolves the prompt widget through the action id.
        action.action_params.insert(
            "flowActionId".to_string(),
            serde_json::Value::String(action.id.to_string()),
        );
        self.persist_action(&action, false).await?;
        Ok(action)
    }

    /// Move a human-action row to its terminal status.
    pub async fn complete_human_action(
        &self,
        mut action: FlowAction,
        status: ActionStatus,
        result: String,
    ) -> Result<(), FlowError> {
        action.status = status;
        action.result = result;
        action.updated = self.now().await?;
        self.persist_action(&action, true).await
    }

    // =========================================================================
    // Subflow trackers
    // =========================================================================

    /// Run the body inside a named nested scope. The subflow row moves
    /// `started → complete/failed/canceled`; a pending-user-action sentinel
    /// or flow cancellation finalizes as `canceled` with a `"canceled:"`
    /// result prefix.
    pub async fn subflow<T, F, Fut>(
        &self,
        name: &str,
        description: &str,
        body: F,
    ) -> Result<T, FlowError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        self.subflow_inner(name, description, false, body).await
    }

    /// Like [`FlowContext::subflow`] but deliberately anchored at the flow,
    /// outside the current parent scope.
    pub async fn detached_subflow<T, F, Fut>(
        &self,
        name: &str,
        description: &str,
        body: F,
    ) -> Result<T, FlowError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        self.subflow_inner(name, description, true, body).await
    }

    async fn subflow_inner<T, F, Fut>(
        &self,
        name: &str,
        description: &str,
        detached: bool,
        body: F,
    ) -> Result<T, FlowError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        let id = self.new_id(prefixes::SUBFLOW).await?;
        let parent_subflow_id = if detached {
            None
        } else {
            self.current_subflow_id()
        };

        let mut subflow = Subflow {
            id: id.clone(),
            workspace_id: self.workspace_id().clone(),
            flow_id: self.flow_id().clone(),
            name: name.to_string(),
            subflow_type: None,
            description: description.to_string(),
            status: SubflowStatus::Started,
            parent_subflow_id,
            result: None,
        };
        self.persist_subflow(&subflow, false).await?;

        // External resources opened inside this scope hook into flow
        // cancellation through the state registry.
        let scope_token = self.cancellation_token().child_token();
        {
            let scope_token = scope_token.clone();
            self.state().register_cancel_fn(move || scope_token.cancel());
        }

        self.push_scope(ScopeFrame {
            subflow_id: id,
            name: name.to_string(),
        });
        let outcome = body().await;
        self.pop_scope();

        match &outcome {
            Ok(value) => {
                subflow.status = SubflowStatus::Complete;
                subflow.result = serde_json::to_string(value).ok();
            }
            Err(err) => match canceled_note(err) {
                Some(note) => {
                    subflow.status = SubflowStatus::Canceled;
                    subflow.result = Some(note);
                }
                None => {
                    subflow.status = SubflowStatus::Failed;
                    subflow.result = Some(err.to_string());
                }
            },
        }

        let detached_persist = self.detached_finalization_enabled().await?;
        self.persist_subflow(&subflow, detached_persist).await?;
        outcome
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn detached_finalization_enabled(&self) -> Result<bool, FlowError> {
        Ok(self
            .version(versions::DETACHED_FINALIZATION, 0, 1)
            .await?
            >= 1)
    }

    async fn new_flow_action(
        &self,
        action_type: &str,
        params: serde_json::Map<String, serde_json::Value>,
        status: ActionStatus,
        is_human_action: bool,
        is_callback_action: bool,
    ) -> Result<FlowAction, FlowError> {
        let id = self.new_id(prefixes::FLOW_ACTION).await?;
        let now = self.now().await?;
        Ok(FlowAction {
            id,
            workspace_id: self.workspace_id().clone(),
            flow_id: self.flow_id().clone(),
            subflow_id: self.current_subflow_id(),
            subflow_name: self.scope_path(),
            action_type: action_type.to_string(),
            action_params: params,
            status,
            result: String::new(),
            is_human_action,
            is_callback_action,
            created: now,
            updated: now,
        })
    }

    /// Persist an action row and publish its change record, as one recorded
    /// activity.
    pub(crate) async fn persist_action(
        &self,
        action: &FlowAction,
        detached: bool,
    ) -> Result<(), FlowError> {
        let storage = self.storage().clone();
        let streamer = self.streamer().clone();
        let action = action.clone();
        let body = move || {
            let storage = storage.clone();
            let streamer = streamer.clone();
            let action = action.clone();
            async move {
                storage.persist_flow_action(action.clone()).await?;
                streamer.add_flow_action_change(&action).await?;
                Ok(())
            }
        };
        if detached {
            self.detached_activity("persist_flow_action", ActivityOptions::default(), body)
                .await
        } else {
            self.activity("persist_flow_action", ActivityOptions::default(), body)
                .await
        }
    }

    /// Persist a subflow row and publish its status transition.
    async fn persist_subflow(&self, subflow: &Subflow, detached: bool) -> Result<(), FlowError> {
        let storage = self.storage().clone();
        let streamer = self.streamer().clone();
        let subflow = subflow.clone();
        let flow_id = self.flow_id().clone();
        let body = move || {
            let storage = storage.clone();
            let streamer = streamer.clone();
            let subflow = subflow.clone();
            let flow_id = flow_id.clone();
            async move {
                storage.persist_subflow(subflow.clone()).await?;
                streamer
                    .add_flow_event(
                        &subflow.workspace_id,
                        &flow_id,
                        FlowEvent::StatusChange {
                            parent_id: flow_id.clone(),
                            status: subflow.status.to_string(),
                            target_id: Some(subflow.id.clone()),
                        },
                    )
                    .await?;
                Ok(())
            }
        };
        if detached {
            self.detached_activity("persist_subflow", ActivityOptions::default(), body)
                .await
        } else {
            self.activity("persist_subflow", ActivityOptions::default(), body)
                .await
        }
    }

    async fn finalize_action<T: Serialize>(
        &self,
        mut action: FlowAction,
        outcome: Result<T, FlowError>,
    ) -> Result<T, FlowError> {
        let mut encode_problem = None;

        match &outcome {
            Ok(value) => {
                action.status = ActionStatus::Complete;
                match serde_json::to_string(value) {
                    Ok(encoded) => action.result = encoded,
                    Err(err) => encode_problem = Some(err.to_string()),
                }
            }
            Err(err) => {
                action.status = ActionStatus::Failed;
                action.result = canceled_note(err).unwrap_or_else(|| err.to_string());
            }
        }
        action.updated = self.now().await?;

        let detached = self.detached_finalization_enabled().await?;
        if let Err(persist_err) = self.persist_action(&action, detached).await {
            return Err(FlowError::TerminalPersist {
                persist: persist_err.to_string(),
                encode: encode_problem,
            });
        }

        if let Some(encode) = encode_problem {
            return Err(FlowError::non_retryable(format!(
                "result of {} could not be encoded: {encode}",
                action.action_type
            )));
        }

        outcome
    }
}
