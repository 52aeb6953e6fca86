//! Durable flow orchestration.
//!
//! The pieces fit together like this:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FlowRuntime                           │
//! │   (registers handlers, drives executions, routes signals)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FlowContext                           │
//! │  (activities with retry, recorded side effects, trackers,   │
//! │   user interaction, replay over the run history)            │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                      │
//!                    ▼                      ▼
//!         ┌──────────────────┐   ┌──────────────────────┐
//!         │   Storage port   │   │  Event streamer port │
//!         └──────────────────┘   └──────────────────────┘
//! ```
//!
//! Every unit of work inside a flow is a tracked FlowAction or Subflow row;
//! every non-deterministic observation is recorded in the run history so a
//! resumed flow retraces its path exactly.

pub mod context;
pub mod error;
pub mod history;
pub mod poller;
pub mod retry;
pub mod runner;
pub mod state;
pub mod tracker;
pub mod user;

/// Behavior-version change ids.
///
/// Branch points gated on these compare the version recorded in the flow's
/// history against what the running build supports, so already-running flows
/// keep the behavior they started with.
pub mod versions {
    /// Set the stored Flow status to `paused` while a user request waits.
    pub const PAUSE_ON_USER_REQUEST: &str = "pause-flow-on-user-request";

    /// Write terminal tracker rows on the detached path under cancellation.
    pub const DETACHED_FINALIZATION: &str = "detached-terminal-finalization";

    /// Offer a `try_again` prompt when an activity exhausts its retries.
    pub const ACTIVITY_USER_RETRY: &str = "activity-user-retry";

    /// Let queued out-of-band user actions preempt the current prompt.
    pub const GO_NEXT_PREEMPTION: &str = "go-next-preemption";
}

pub use context::FlowContext;
pub use error::FlowError;
pub use history::{
    FlowExecution, HistoryError, MemoryRunHistory, RunEvent, RunHistoryStore, RunStatus,
};
pub use poller::FailurePoller;
pub use retry::{ActivityOptions, RetryPolicy};
pub use runner::{FlowHandle, FlowRuntime};
pub use state::{ChildRequest, FlowState, FlowStateRegistry};
pub use user::UserRequest;
