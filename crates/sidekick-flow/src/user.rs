//! Human-in-the-loop primitives: raising user requests, completing them
//! from responses, and the user-confirmed activity retry loop.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use sidekick_domain::{ActionStatus, FlowStatus, RequestKind, UserResponse};

use crate::context::FlowContext;
use crate::error::FlowError;
use crate::retry::ActivityOptions;
use crate::state::ChildRequest;
use crate::versions;

/// A request for user input raised from inside a flow.
#[derive(Debug, Clone)]
pub struct UserRequest {
    pub kind: RequestKind,
    pub message: String,
    pub params: serde_json::Map<String, serde_json::Value>,

    /// Marks prompts whose answer arrives through an external callback
    /// rather than the regular response signal.
    pub is_callback: bool,

    /// Returned instead of prompting when human-in-the-loop is off. Without
    /// one, requesting input with HIL off is an error.
    pub auto_response: Option<UserResponse>,
}

impl UserRequest {
    pub fn new(kind: RequestKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            params: serde_json::Map::new(),
            is_callback: false,
            auto_response: None,
        }
    }

    pub fn approval(message: impl Into<String>) -> Self {
        Self::new(RequestKind::Approval, message)
    }

    pub fn merge_approval(message: impl Into<String>) -> Self {
        Self::new(RequestKind::MergeApproval, message)
    }

    pub fn free_form(message: impl Into<String>) -> Self {
        Self::new(RequestKind::FreeForm, message)
    }

    pub fn multiple_choice(
        message: impl Into<String>,
        choices: &[&str],
    ) -> Self {
        let mut request = Self::new(RequestKind::MultipleChoice, message);
        request
            .params
            .insert("choices".to_string(), json!(choices));
        request
    }

    pub fn continue_prompt(message: impl Into<String>) -> Self {
        Self::new(RequestKind::Continue, message)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_auto_response(mut self, response: UserResponse) -> Self {
        self.auto_response = Some(response);
        self
    }
}

impl FlowContext {
    /// Raise a user-interaction request and block until the response.
    ///
    /// The human FlowAction row is persisted *before* the wait, so an
    /// external UI always sees the prompt before the flow is observably
    /// stalled. Under the pause gate the Flow's stored status moves to
    /// `paused` for the duration of the wait; completing the human action
    /// clears it. Queued out-of-band actions preempt the wait with the
    /// pending-action sentinel (gated).
    pub async fn request_user_action(
        &self,
        request: UserRequest,
    ) -> Result<UserResponse, FlowError> {
        if !self.human_in_loop() {
            return request
                .auto_response
                .ok_or(FlowError::UserInteractionDisabled);
        }

        let preemption = self.version(versions::GO_NEXT_PREEMPTION, 0, 1).await? >= 1;
        if preemption {
            if let Some(action) = self.state().take_pending_action() {
                return Err(FlowError::PendingAction(action));
            }
        }

        // Action-params contract: the UI needs at least kind + message (and
        // the action id, stamped by track_human) to render the right widget.
        let mut params = request.params.clone();
        params.insert("kind".to_string(), json!(request.kind.as_str()));
        params.insert("message".to_string(), json!(request.message));

        let action = self
            .track_human(
                &format!("user_request.{}", request.kind),
                params.clone(),
                request.is_callback,
            )
            .await?;

        // Outbound requestForUser: surface the prompt to a parent workflow,
        // if one is running in this process.
        self.state_registry_notify_parent(ChildRequest {
            from_flow_id: self.flow_id().clone(),
            kind: request.kind,
            params,
        });

        let pause_gate = self.version(versions::PAUSE_ON_USER_REQUEST, 0, 1).await? >= 1;
        if pause_gate {
            self.persist_flow_status(FlowStatus::Paused).await?;
        }

        match self.wait_for_user_response_inner(preemption).await {
            Ok(response) => {
                self.complete_human_action(
                    action,
                    ActionStatus::Complete,
                    serde_json::to_string(&response)?,
                )
                .await?;
                if pause_gate {
                    self.state().set_paused(false);
                    self.persist_flow_status(FlowStatus::Running).await?;
                }
                Ok(response)
            }
            Err(err) => {
                let note = match &err {
                    FlowError::PendingAction(a) => {
                        format!("canceled: pending user action {}", a.action_type)
                    }
                    other => format!("canceled: {other}"),
                };
                self.complete_human_action(action, ActionStatus::Failed, note)
                    .await?;
                Err(err)
            }
        }
    }

    /// Execute an activity; on final failure, offer the user a `try_again`
    /// prompt and re-execute on confirmation.
    ///
    /// A queued pending action outranks the retry prompt and surfaces as the
    /// pending-action sentinel. With human-in-the-loop off (or the behavior
    /// gate below 1) failures propagate immediately.
    pub async fn perform_with_user_retry<T, F, Fut>(
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
        let retry_enabled = self.version(versions::ACTIVITY_USER_RETRY, 0, 1).await? >= 1;

        loop {
            match self.activity(name, options.clone(), &body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_passthrough() => return Err(err),
                Err(err) => {
                    if !retry_enabled || !self.human_in_loop() {
                        return Err(err);
                    }
                    if let Some(action) = self.state().take_pending_action() {
                        return Err(FlowError::PendingAction(action));
                    }

                    let prompt = UserRequest::continue_prompt(format!(
                        "{name} failed: {err}. Try again?"
                    ))
                    .with_param("prompt".to_string(), json!("try_again"))
                    .with_param("failedAction".to_string(), json!(name));

                    let response = self.request_user_action(prompt).await?;
                    if response.approved == Some(false) {
                        return Err(err);
                    }
                    // Confirmed: fall through and re-execute.
                }
            }
        }
    }

    pub(crate) async fn persist_flow_status(&self, status: FlowStatus) -> Result<(), FlowError> {
        let storage = self.storage().clone();
        let flow = self.flow().clone();
        self.activity("persist_flow_status", ActivityOptions::default(), move || {
            let storage = storage.clone();
            let mut flow = flow.clone();
            async move {
                flow.status = status;
                sidekick_storage::Storage::persist_flow(&storage, flow)
                    .await
                    .map_err(FlowError::from)
            }
        })
        .await
    }
}
