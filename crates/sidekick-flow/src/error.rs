//! Flow-layer error taxonomy.

use sidekick_domain::{Id, PendingUserAction};
use sidekick_storage::StoreError;
use sidekick_streamer::StreamError;

use crate::history::HistoryError;

/// Errors surfaced by flow execution.
///
/// The retryability split drives the activity retry loop: transport-level
/// trouble is retried, validation and the user-interaction sentinels are not.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// Application-level activity failure with an explicit retry decision.
    #[error("{message}")]
    Activity { message: String, retryable: bool },

    /// An activity exhausted its retry budget (or failed fast).
    #[error("activity {activity} failed after {attempts} attempt(s): {message}")]
    ActivityFailed {
        activity: String,
        attempts: u32,
        message: String,
    },

    /// A higher-priority user action preempted the current work. Callers
    /// propagate this upward; trackers record `canceled`, not `failed`.
    #[error("pending user action: {}", .0.action_type)]
    PendingAction(PendingUserAction),

    /// A user response was requested while human-in-the-loop is off and no
    /// auto-response fallback was supplied.
    #[error("user interaction is disabled for this flow")]
    UserInteractionDisabled,

    /// The flow was cancelled.
    #[error("flow canceled")]
    Canceled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The terminal tracker row could not be written. Carries the persistence
    /// failure and, if the body's return value would not encode either, that
    /// problem too — nothing is lost silently.
    #[error("terminal persist failed: {persist}{}", .encode.as_deref().map(|e| format!(" (result encoding also failed: {e})")).unwrap_or_default())]
    TerminalPersist {
        persist: String,
        encode: Option<String>,
    },

    /// No running flow matches the signal's target.
    #[error("no running flow for {0}")]
    UnknownFlow(Id),

    /// Unrecoverable misconfiguration; aborts startup.
    #[error("{0}")]
    Fatal(String),
}

impl FlowError {
    /// Application-level transient failure (retried by the activity loop).
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Activity {
            message: message.into(),
            retryable: true,
        }
    }

    /// Application-level permanent failure (fails fast).
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::Activity {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the activity retry loop may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Stream(e) => matches!(e, StreamError::Transport(_)),
            Self::History(e) => e.is_transient(),
            Self::Activity { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Sentinels that must pass through the activity machinery untouched.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            Self::PendingAction(_) | Self::Canceled | Self::UserInteractionDisabled
        )
    }
}
