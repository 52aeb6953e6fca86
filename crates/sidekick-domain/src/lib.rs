//! Domain model for the flow-orchestration core.
//!
//! Entities are plain data: a [`Workspace`] owns [`Task`]s, each task runs as
//! one or more [`Flow`]s, flows nest [`Subflow`]s, and every unit of tracked
//! work is a [`FlowAction`]. State transitions are broadcast as [`FlowEvent`]s.
//!
//! All identifiers are prefixed, time-ordered strings ([`Id`]); all
//! timestamps are UTC and serialize RFC3339 with a `Z` suffix.

pub mod events;
pub mod flow;
pub mod flow_action;
pub mod ids;
pub mod provider_key;
pub mod subflow;
pub mod task;
pub mod user;
pub mod workspace;
pub mod worktree;

pub use events::{ChatMessageDelta, FlowEvent, FlowEventContainer, ToolCallChunk};
pub use flow::{Flow, FlowStatus};
pub use flow_action::{ActionStatus, FlowAction, FlowActionChange};
pub use ids::{prefixes, Id};
pub use provider_key::{ProviderKey, SecretManagerType};
pub use subflow::{Subflow, SubflowStatus};
pub use task::{Task, TaskStatus};
pub use user::{PendingUserAction, RequestKind, UserResponse};
pub use workspace::{ConfigMode, Workspace, WorkspaceConfig};
pub use worktree::Worktree;
