//! Per-flow in-memory control surface.
//!
//! A flow's mutable runtime state (paused flag, cancel-funcs, pending
//! user-action queue, scratch values) must be reachable both from workflow
//! code and from out-of-band signal handlers (the HTTP API). It lives in a
//! registry keyed by flow id; each entry guards itself with its own lock —
//! there is no process-wide lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use sidekick_domain::{Id, PendingUserAction, RequestKind, UserResponse};

type CancelFn = Box<dyn FnOnce() + Send>;

/// A user-interaction request a child flow routed to its parent workflow.
#[derive(Debug, Clone)]
pub struct ChildRequest {
    pub from_flow_id: Id,
    pub kind: RequestKind,
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Default)]
struct FlowStateInner {
    paused: bool,
    pending_actions: VecDeque<PendingUserAction>,
    responses: VecDeque<UserResponse>,
    child_requests: VecDeque<ChildRequest>,
    values: HashMap<String, serde_json::Value>,
    cancel_fns: Vec<CancelFn>,
}

/// Control surface for one flow.
pub struct FlowState {
    inner: Mutex<FlowStateInner>,
    notify: Notify,
    cancel: CancellationToken,
}

impl FlowState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FlowStateInner::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Token observed by every suspension point of the flow.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Queue an out-of-band user action. Queued actions outrank the prompt
    /// currently waiting.
    pub fn push_pending_action(&self, action: PendingUserAction) {
        self.inner.lock().pending_actions.push_back(action);
        self.notify.notify_one();
    }

    pub fn take_pending_action(&self) -> Option<PendingUserAction> {
        self.inner.lock().pending_actions.pop_front()
    }

    pub fn has_pending_action(&self) -> bool {
        !self.inner.lock().pending_actions.is_empty()
    }

    /// Deliver an inbound user response.
    pub fn push_response(&self, response: UserResponse) {
        self.inner.lock().responses.push_back(response);
        self.notify.notify_one();
    }

    pub fn take_response(&self) -> Option<UserResponse> {
        self.inner.lock().responses.pop_front()
    }

    /// Wait until a response or (when allowed) a pending action arrives.
    /// Returns `Err(action)` when a pending action preempted the wait.
    pub async fn next_response(
        &self,
        allow_preemption: bool,
        cancel: &CancellationToken,
    ) -> Option<Result<UserResponse, PendingUserAction>> {
        loop {
            if allow_preemption {
                if let Some(action) = self.take_pending_action() {
                    return Some(Err(action));
                }
            }
            if let Some(response) = self.take_response() {
                return Some(Ok(response));
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Route a child flow's user-interaction request to this (parent) flow.
    pub fn push_child_request(&self, request: ChildRequest) {
        self.inner.lock().child_requests.push_back(request);
        self.notify.notify_one();
    }

    pub fn take_child_request(&self) -> Option<ChildRequest> {
        self.inner.lock().child_requests.pop_front()
    }

    /// Register a function to run when the flow is cancelled.
    pub fn register_cancel_fn(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.lock().cancel_fns.push(Box::new(f));
    }

    /// Fire the cancellation token and drain every registered cancel-func.
    pub fn cancel_all(&self) {
        let fns: Vec<CancelFn> = std::mem::take(&mut self.inner.lock().cancel_fns);
        self.cancel.cancel();
        for f in fns {
            f();
        }
        self.notify.notify_one();
    }

    pub fn set_value(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().values.insert(key.into(), value);
    }

    pub fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().values.get(key).cloned()
    }

    /// Bootstrap the scratch map before a flow has run. Test-only entry
    /// point; production code populates values through `set_value` as the
    /// flow executes.
    pub fn init_values(&self, values: HashMap<String, serde_json::Value>) {
        self.inner.lock().values = values;
    }
}

/// Registry of per-flow control surfaces, keyed by flow id.
#[derive(Clone, Default)]
pub struct FlowStateRegistry {
    entries: Arc<Mutex<HashMap<Id, Arc<FlowState>>>>,
}

impl FlowStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, flow_id: &Id) -> Arc<FlowState> {
        self.entries
            .lock()
            .entry(flow_id.clone())
            .or_insert_with(FlowState::new)
            .clone()
    }

    pub fn get(&self, flow_id: &Id) -> Option<Arc<FlowState>> {
        self.entries.lock().get(flow_id).cloned()
    }

    pub fn remove(&self, flow_id: &Id) {
        self.entries.lock().remove(flow_id);
    }
}
