//! Flow events: user-visible updates published to the event streamer.
//!
//! Events form an append-only log sharded by (workspace, flow, parent-id).
//! Order within one parent sub-stream is authoritative; nothing is promised
//! across sub-streams.
//!
//! The wire form is a JSON object whose `eventType` field selects the
//! variant; deserializing an unknown `eventType` fails.

use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// A fragment of a streamed chat message.
///
/// Deltas are keyed by the flow action performing the LLM call and arrive in
/// order; text and tool-call pieces may be interleaved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallChunk>,
}

/// A partial tool call inside a chat delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_delta: Option<String>,
}

/// Events published on the flow event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FlowEvent {
    /// Latest human-readable status line for a parent.
    ProgressText { parent_id: Id, text: String },

    /// A status transition on a target entity. `target_id` defaults to the
    /// parent when absent.
    StatusChange {
        parent_id: Id,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<Id>,
    },

    /// A partial LLM message keyed by the flow action emitting it.
    ChatMessageDelta {
        flow_action_id: Id,
        delta: ChatMessageDelta,
    },

    /// Sentinel terminating the sub-stream rooted at `parent_id`. No event
    /// for that parent may follow.
    EndStream { parent_id: Id },

    /// A unified diff attached to a subflow.
    CodeDiff { subflow_id: Id, diff: String },

    /// External dev process started. Carried, not produced, by the core.
    DevRunStarted {
        parent_id: Id,
        run_id: String,
        command: String,
    },

    /// Output from an external dev process.
    DevRunOutput {
        parent_id: Id,
        run_id: String,
        output: String,
    },

    /// External dev process finished.
    DevRunEnded {
        parent_id: Id,
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl FlowEvent {
    /// The sub-stream key this event belongs to.
    pub fn parent_id(&self) -> &Id {
        match self {
            Self::ProgressText { parent_id, .. }
            | Self::StatusChange { parent_id, .. }
            | Self::EndStream { parent_id }
            | Self::DevRunStarted { parent_id, .. }
            | Self::DevRunOutput { parent_id, .. }
            | Self::DevRunEnded { parent_id, .. } => parent_id,
            Self::ChatMessageDelta { flow_action_id, .. } => flow_action_id,
            Self::CodeDiff { subflow_id, .. } => subflow_id,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        matches!(self, Self::EndStream { .. })
    }

    /// Convenience constructor for progress lines.
    pub fn progress(parent_id: impl Into<Id>, text: impl Into<String>) -> Self {
        Self::ProgressText {
            parent_id: parent_id.into(),
            text: text.into(),
        }
    }

    /// Convenience constructor for status transitions on the parent itself.
    pub fn status_change(parent_id: impl Into<Id>, status: impl Into<String>) -> Self {
        Self::StatusChange {
            parent_id: parent_id.into(),
            status: status.into(),
            target_id: None,
        }
    }
}

/// Wire wrapper used by boundaries that may deliver frames with no event
/// (keep-alives). A held `null` round-trips as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEventContainer {
    pub flow_event: Option<FlowEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_discriminant() {
        let event = FlowEvent::progress("flow_1", "planning edits");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventType\":\"progress_text\""));
        assert!(json.contains("\"parentId\":\"flow_1\""));

        let parsed: FlowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let raw = r#"{"eventType":"telemetry_blip","parentId":"flow_1"}"#;
        let err = serde_json::from_str::<FlowEvent>(raw).unwrap_err();
        assert!(err.to_string().contains("telemetry_blip"));
    }

    #[test]
    fn test_chat_delta_round_trip() {
        let event = FlowEvent::ChatMessageDelta {
            flow_action_id: Id::new("fa_9"),
            delta: ChatMessageDelta {
                role: Some("assistant".to_string()),
                text_delta: Some("Let me look at".to_string()),
                tool_calls: vec![ToolCallChunk {
                    tool_call_id: Some("call_1".to_string()),
                    name: Some("read_file".to_string()),
                    arguments_delta: Some("{\"path\":".to_string()),
                }],
            },
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: FlowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.parent_id(), &Id::new("fa_9"));
    }

    #[test]
    fn test_every_variant_round_trips() {
        let variants = vec![
            FlowEvent::progress("sf_1", "running tests"),
            FlowEvent::StatusChange {
                parent_id: Id::new("flow_1"),
                status: "paused".to_string(),
                target_id: Some(Id::new("flow_1")),
            },
            FlowEvent::EndStream {
                parent_id: Id::new("flow_1"),
            },
            FlowEvent::CodeDiff {
                subflow_id: Id::new("sf_2"),
                diff: "--- a/lib.rs\n+++ b/lib.rs\n".to_string(),
            },
            FlowEvent::DevRunStarted {
                parent_id: Id::new("flow_1"),
                run_id: "run_1".to_string(),
                command: "npm run dev".to_string(),
            },
            FlowEvent::DevRunOutput {
                parent_id: Id::new("flow_1"),
                run_id: "run_1".to_string(),
                output: "listening on :3000".to_string(),
            },
            FlowEvent::DevRunEnded {
                parent_id: Id::new("flow_1"),
                run_id: "run_1".to_string(),
                exit_code: Some(0),
            },
        ];

        for event in variants {
            let json = serde_json::to_string(&event).unwrap();
            let parsed: FlowEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn test_container_null_round_trip() {
        let container = FlowEventContainer { flow_event: None };

        let json = serde_json::to_string(&container).unwrap();
        assert_eq!(json, "{\"flowEvent\":null}");

        let parsed: FlowEventContainer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, container);
    }

    #[test]
    fn test_container_event_round_trip() {
        let container = FlowEventContainer {
            flow_event: Some(FlowEvent::EndStream {
                parent_id: Id::new("sf_1"),
            }),
        };

        let json = serde_json::to_string(&container).unwrap();
        let parsed: FlowEventContainer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, container);
    }
}
