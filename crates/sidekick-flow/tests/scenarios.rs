//! End-to-end flow scenarios against the in-memory backends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sidekick_domain::{
    prefixes, ActionStatus, ConfigMode, Flow, FlowStatus, Id, PendingUserAction, SubflowStatus,
    Task, TaskStatus, UserResponse, Workspace,
};
use sidekick_flow::{
    ActivityOptions, FailurePoller, FlowContext, FlowError, FlowRuntime, MemoryRunHistory,
    RunHistoryStore, RunStatus, UserRequest,
};
use sidekick_storage::{Storage, StorageBackend};
use sidekick_streamer::{EventStreamer, StreamerBackend};

/// Poll the body every 10ms until it yields Some, for at most ~2s.
macro_rules! wait_for {
    ($body:expr) => {{
        let mut found = None;
        for _ in 0..200 {
            if let Some(value) = $body {
                found = Some(value);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        found.expect("condition not reached within 2s")
    }};
}

struct Harness {
    storage: StorageBackend,
    streamer: StreamerBackend,
    history: Arc<MemoryRunHistory>,
    runtime: FlowRuntime,
}

fn harness() -> Harness {
    let storage = StorageBackend::memory();
    let streamer = StreamerBackend::memory();
    let history = Arc::new(MemoryRunHistory::new());
    let runtime = FlowRuntime::new(storage.clone(), streamer.clone(), history.clone());
    Harness {
        storage,
        streamer,
        history,
        runtime,
    }
}

async fn seed_workspace(h: &Harness) -> Workspace {
    let now = Utc::now();
    let workspace = Workspace {
        id: Id::generate(prefixes::WORKSPACE),
        name: "demo".to_string(),
        local_repo_dir: "/tmp/demo".to_string(),
        config_mode: ConfigMode::Local,
        created: now,
        updated: now,
    };
    h.storage
        .persist_workspace(workspace.clone())
        .await
        .unwrap();
    workspace
}

async fn seed_task(h: &Harness, workspace_id: &Id) -> Task {
    let now = Utc::now();
    let task = Task {
        id: Id::generate(prefixes::TASK),
        workspace_id: workspace_id.clone(),
        title: "implement feature".to_string(),
        description: String::new(),
        status: TaskStatus::ToDo,
        agent_type: "smart".to_string(),
        flow_type: "basic_dev".to_string(),
        flow_options: None,
        links: vec![],
        created: now,
        updated: now,
        archived: None,
    };
    h.storage.persist_task(task.clone()).await.unwrap();
    task
}

fn new_flow(workspace_id: &Id, parent_id: &Id, flow_type: &str) -> Flow {
    Flow {
        id: Id::generate(prefixes::FLOW),
        workspace_id: workspace_id.clone(),
        flow_type: flow_type.to_string(),
        parent_id: parent_id.clone(),
        status: FlowStatus::Running,
    }
}

fn no_params() -> serde_json::Map<String, serde_json::Value> {
    serde_json::Map::new()
}

async fn pending_human_action(
    h: &Harness,
    workspace_id: &Id,
    flow_id: &Id,
) -> Option<sidekick_domain::FlowAction> {
    h.storage
        .list_flow_actions(workspace_id, flow_id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.is_human_action && a.status == ActionStatus::Pending)
}

// =============================================================================
// Scenario: happy path — three nested subflows, one action each
// =============================================================================

#[tokio::test]
async fn test_happy_path_nested_subflows() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    h.runtime.register("basic_dev", |ctx: FlowContext| async move {
        let s1 = ctx.clone();
        ctx.subflow("requirements", "gather requirements", move || async move {
            s1.track("gather_requirements", no_params(), || async {
                Ok(json!({"step": 1}))
            })
            .await?;
            let s2 = s1.clone();
            s1.subflow("plan", "draft the plan", move || async move {
                s2.track("draft_plan", no_params(), || async { Ok(json!({"step": 2})) })
                    .await?;
                let s3 = s2.clone();
                s2.subflow("edit", "apply the edits", move || async move {
                    s3.track("apply_edits", no_params(), || async {
                        Ok(json!({"step": 3}))
                    })
                    .await
                })
                .await
            })
            .await
        })
        .await?;
        Ok(json!("complete"))
    });

    // Watch the action-changes stream from the beginning.
    let cancel = CancellationToken::new();
    let flow = new_flow(&workspace.id, &task.id, "basic_dev");
    let mut changes = h
        .streamer
        .subscribe_flow_action_changes(&workspace.id, &flow.id, "0", cancel.clone())
        .await
        .unwrap();

    let handle = h.runtime.start_flow(flow.clone(), true).await.unwrap();
    let result = handle.join.await.unwrap().unwrap();
    assert_eq!(result, json!("complete"));

    // Flow reached a terminal status.
    let stored_flow = h.storage.get_flow(&workspace.id, &flow.id).await.unwrap();
    assert_eq!(stored_flow.status, FlowStatus::Complete);

    // Every subflow complete, correctly nested.
    let subflows = h
        .storage
        .list_subflows_by_flow(&workspace.id, &flow.id)
        .await
        .unwrap();
    assert_eq!(subflows.len(), 3);
    assert!(subflows.iter().all(|s| s.status == SubflowStatus::Complete));
    assert_eq!(
        subflows
            .iter()
            .filter(|s| s.parent_subflow_id.is_some())
            .count(),
        2
    );

    // Three action rows, all complete, insertion order preserved.
    let actions = h
        .storage
        .list_flow_actions(&workspace.id, &flow.id)
        .await
        .unwrap();
    assert_eq!(actions.len(), 3);
    assert!(actions.iter().all(|a| a.status == ActionStatus::Complete));
    let types: Vec<_> = actions.iter().map(|a| a.action_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["gather_requirements", "draft_plan", "apply_edits"]
    );

    // Required-id invariant, monotonic stamps, legacy scope paths.
    for action in &actions {
        assert!(action.has_required_ids());
        assert!(action.updated >= action.created);
        assert!(!action.subflow_name.is_empty());
    }
    assert_eq!(actions[2].subflow_name, "requirements:|:plan:|:edit");

    // Changes stream: start + complete per action, in order.
    let mut seen = Vec::new();
    for _ in 0..6 {
        let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push((change.action_type.clone(), change.status));
    }
    assert_eq!(
        seen,
        vec![
            ("gather_requirements".to_string(), ActionStatus::Started),
            ("gather_requirements".to_string(), ActionStatus::Complete),
            ("draft_plan".to_string(), ActionStatus::Started),
            ("draft_plan".to_string(), ActionStatus::Complete),
            ("apply_edits".to_string(), ActionStatus::Started),
            ("apply_edits".to_string(), ActionStatus::Complete),
        ]
    );

    cancel.cancel();
}

// =============================================================================
// Scenario: user approval pauses the flow, response resumes it
// =============================================================================

#[tokio::test]
async fn test_user_approval_pause_and_resume() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    h.runtime
        .register("approval_flow", |ctx: FlowContext| async move {
            let response = ctx
                .request_user_action(UserRequest::approval("Apply the generated plan?"))
                .await?;
            Ok(json!({"approved": response.approved}))
        });

    let flow = new_flow(&workspace.id, &task.id, "approval_flow");
    let handle = h.runtime.start_flow(flow.clone(), true).await.unwrap();

    // The pending human action is visible before the flow blocks.
    let pending = wait_for!(pending_human_action(&h, &workspace.id, &flow.id).await);
    assert_eq!(pending.action_params["kind"], "approval");
    assert_eq!(
        pending.action_params["message"],
        "Apply the generated plan?"
    );
    assert_eq!(
        pending.action_params["flowActionId"],
        json!(pending.id.to_string())
    );

    // The flow's stored status moved to paused for the wait.
    wait_for!({
        let stored = h.storage.get_flow(&workspace.id, &flow.id).await.unwrap();
        (stored.status == FlowStatus::Paused).then_some(())
    });

    h.runtime
        .signal_user_response(UserResponse::approval(flow.id.clone(), true))
        .unwrap();

    let result = handle.join.await.unwrap().unwrap();
    assert_eq!(result, json!({"approved": true}));

    // The human action moved pending -> complete, and the flow finished.
    let human = h
        .storage
        .get_flow_action(&workspace.id, &pending.id)
        .await
        .unwrap();
    assert_eq!(human.status, ActionStatus::Complete);
    let stored = h.storage.get_flow(&workspace.id, &flow.id).await.unwrap();
    assert_eq!(stored.status, FlowStatus::Complete);
}

// =============================================================================
// Scenario: activity failure, user-confirmed retry, then success
// =============================================================================

#[tokio::test]
async fn test_activity_failure_with_user_retry() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_flow = attempts.clone();

    h.runtime.register("retry_flow", move |ctx: FlowContext| {
        let attempts = attempts_in_flow.clone();
        async move {
            let inner_ctx = ctx.clone();
            ctx.track("tracked_work", no_params(), move || async move {
                inner_ctx
                    .perform_with_user_retry("flaky_call", ActivityOptions::no_retry(), move || {
                        let attempts = attempts.clone();
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(FlowError::transient("upstream 503"))
                            } else {
                                Ok(json!("recovered"))
                            }
                        }
                    })
                    .await
            })
            .await
        }
    });

    let flow = new_flow(&workspace.id, &task.id, "retry_flow");
    let handle = h.runtime.start_flow(flow.clone(), true).await.unwrap();

    // The try_again prompt surfaces as a pending human action.
    let prompt = wait_for!(pending_human_action(&h, &workspace.id, &flow.id).await);
    assert_eq!(prompt.action_params["kind"], "continue");
    assert_eq!(prompt.action_params["prompt"], "try_again");
    assert_eq!(prompt.action_params["failedAction"], "flaky_call");

    h.runtime
        .signal_user_response(UserResponse::approval(flow.id.clone(), true))
        .unwrap();

    let result = handle.join.await.unwrap().unwrap();
    assert_eq!(result, json!("recovered"));

    // Exactly two executions of the flaky activity.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // No failed tracker row: the inner failure lives in the run history
    // only. The outer tracked action completed.
    let actions = h
        .storage
        .list_flow_actions(&workspace.id, &flow.id)
        .await
        .unwrap();
    assert!(actions.iter().all(|a| a.status != ActionStatus::Failed));
    let outer = actions
        .iter()
        .find(|a| a.action_type == "tracked_work")
        .unwrap();
    assert_eq!(outer.status, ActionStatus::Complete);
}

// =============================================================================
// Scenario: cancellation finalizes the open subflow as canceled
// =============================================================================

#[tokio::test]
async fn test_cancellation_writes_terminal_rows() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    h.runtime
        .register("cancel_flow", |ctx: FlowContext| async move {
            let inner = ctx.clone();
            ctx.subflow("long_work", "waits forever", move || async move {
                inner
                    .timer("wait_for_world_peace", Duration::from_secs(3600))
                    .await?;
                Ok(json!("unreachable"))
            })
            .await?;
            Ok(json!("done"))
        });

    let flow = new_flow(&workspace.id, &task.id, "cancel_flow");

    // Subscribe to the flow's own sub-stream to observe end_stream.
    let cancel = CancellationToken::new();
    let (parents_tx, parents_rx) = mpsc::channel(4);
    let mut subscription = h
        .streamer
        .subscribe_flow_events(&workspace.id, &flow.id, "0", parents_rx, cancel.clone())
        .await
        .unwrap();
    parents_tx.send(flow.id.clone()).await.unwrap();

    let handle = h.runtime.start_flow(flow.clone(), true).await.unwrap();

    wait_for!({
        let subflows = h
            .storage
            .list_subflows_by_flow(&workspace.id, &flow.id)
            .await
            .unwrap();
        (!subflows.is_empty()).then_some(())
    });

    h.runtime.cancel_flow(&flow.id).unwrap();

    let result = handle.join.await.unwrap();
    assert!(matches!(result, Err(FlowError::Canceled)));

    // The subflow finalized as canceled even though the flow context was
    // already cancelled when the terminal row was written.
    let subflows = h
        .storage
        .list_subflows_by_flow(&workspace.id, &flow.id)
        .await
        .unwrap();
    assert_eq!(subflows.len(), 1);
    assert_eq!(subflows[0].status, SubflowStatus::Canceled);
    assert!(subflows[0]
        .result
        .as_deref()
        .unwrap()
        .starts_with("canceled:"));

    // end_stream arrives on the flow's sub-stream.
    let end = wait_for!({
        match tokio::time::timeout(Duration::from_millis(50), subscription.events.recv()).await {
            Ok(Some(envelope)) if envelope.event.is_end_stream() => Some(envelope),
            _ => None,
        }
    });
    assert_eq!(end.event.parent_id(), &flow.id);

    // The parent task is not failed yet; cancellation is not a failure and
    // reconciliation is the sweeper's job.
    let stored_task = h.storage.get_task(&workspace.id, &task.id).await.unwrap();
    assert_eq!(stored_task.status, TaskStatus::ToDo);

    let execution = h.history.get_execution(&flow.id).await.unwrap();
    assert_eq!(execution.status, RunStatus::Cancelled);

    cancel.cancel();
}

// =============================================================================
// Scenario: queued out-of-band action preempts the current prompt
// =============================================================================

#[tokio::test]
async fn test_pending_action_preempts_prompt() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    h.runtime
        .register("prompt_flow", |ctx: FlowContext| async move {
            let response = ctx
                .request_user_action(UserRequest::free_form("Anything to add?"))
                .await?;
            Ok(json!({"content": response.content}))
        });

    let flow = new_flow(&workspace.id, &task.id, "prompt_flow");
    let handle = h.runtime.start_flow(flow.clone(), true).await.unwrap();

    wait_for!(pending_human_action(&h, &workspace.id, &flow.id).await);

    h.runtime
        .queue_pending_action(&flow.id, PendingUserAction::new("go_next_step"))
        .unwrap();

    let result = handle.join.await.unwrap();
    match result {
        Err(FlowError::PendingAction(action)) => {
            assert_eq!(action.action_type, "go_next_step")
        }
        other => panic!("expected pending-action sentinel, got {other:?}"),
    }

    // The human action row finalized with a canceled note, not a bare
    // failure message.
    let actions = h
        .storage
        .list_flow_actions(&workspace.id, &flow.id)
        .await
        .unwrap();
    let human = actions.iter().find(|a| a.is_human_action).unwrap();
    assert_eq!(human.status, ActionStatus::Failed);
    assert!(human.result.starts_with("canceled:"));

    let execution = h.history.get_execution(&flow.id).await.unwrap();
    assert_eq!(execution.status, RunStatus::Cancelled);
}

// =============================================================================
// Scenario: failure sweeper reconciles the parent task
// =============================================================================

#[tokio::test]
async fn test_failure_sweeper_marks_parent_task() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    h.runtime
        .register("failing_flow", |ctx: FlowContext| async move {
            ctx.activity("doomed_call", ActivityOptions::no_retry(), || async {
                Err::<serde_json::Value, _>(FlowError::non_retryable("model refused"))
            })
            .await
        });

    let flow = new_flow(&workspace.id, &task.id, "failing_flow");
    let handle = h.runtime.start_flow(flow.clone(), false).await.unwrap();
    assert!(handle.join.await.unwrap().is_err());

    let execution = h.history.get_execution(&flow.id).await.unwrap();
    assert_eq!(execution.status, RunStatus::Failed);

    let poller = FailurePoller::new(h.storage.clone(), h.streamer.clone(), h.history.clone());

    let updated = poller.sweep_workspace(&workspace.id).await.unwrap();
    assert_eq!(updated, 1);
    let stored = h.storage.get_task(&workspace.id, &task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);

    // Idempotent: a second sweep is a no-op.
    let updated = poller.sweep_workspace(&workspace.id).await.unwrap();
    assert_eq!(updated, 0);
}

// =============================================================================
// Scenario: human-in-the-loop off
// =============================================================================

#[tokio::test]
async fn test_user_interaction_disabled() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    h.runtime
        .register("hil_off_flow", |ctx: FlowContext| async move {
            // With an auto-response the request degrades gracefully.
            let auto = ctx
                .request_user_action(UserRequest::approval("Merge?").with_auto_response(
                    UserResponse::approval(ctx.flow_id().clone(), true),
                ))
                .await?;
            assert_eq!(auto.approved, Some(true));

            // Without one it is an error.
            match ctx
                .request_user_action(UserRequest::free_form("Name?"))
                .await
            {
                Err(FlowError::UserInteractionDisabled) => Ok(json!("raised")),
                other => Err(FlowError::non_retryable(format!(
                    "expected disabled error, got {other:?}"
                ))),
            }
        });

    let flow = new_flow(&workspace.id, &task.id, "hil_off_flow");
    let handle = h.runtime.start_flow(flow, false).await.unwrap();
    let result = handle.join.await.unwrap().unwrap();
    assert_eq!(result, json!("raised"));
}

// =============================================================================
// Scenario: worktree bookkeeping and chat deltas from inside a flow
// =============================================================================

#[tokio::test]
async fn test_worktree_and_chat_delta_from_flow() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    h.runtime
        .register("editing_flow", |ctx: FlowContext| async move {
            let worktree = ctx
                .create_worktree("sidekick/feature-x", "/tmp/worktrees/feature-x")
                .await?;

            let streamed: serde_json::Value = ctx
                .track("generate_edits", no_params(), || async {
                    Ok(json!({"edited": 1}))
                })
                .await?;

            // Attach the streamed transcript fragment to the action that
            // produced it.
            let storage = ctx.storage().clone();
            let workspace_id = ctx.workspace_id().clone();
            let flow_id = ctx.flow_id().clone();
            let action_id: Id = ctx
                .activity("latest_action_id", ActivityOptions::default(), move || {
                    let storage = storage.clone();
                    let workspace_id = workspace_id.clone();
                    let flow_id = flow_id.clone();
                    async move {
                        let actions = storage.list_flow_actions(&workspace_id, &flow_id).await?;
                        actions
                            .last()
                            .map(|a| a.id.clone())
                            .ok_or_else(|| FlowError::non_retryable("no actions recorded"))
                    }
                })
                .await?;
            ctx.publish_chat_delta(
                &action_id,
                sidekick_domain::ChatMessageDelta {
                    role: Some("assistant".to_string()),
                    text_delta: Some("Editing lib.rs".to_string()),
                    tool_calls: vec![],
                },
            )
            .await?;

            Ok(json!({"worktree": worktree.name, "result": streamed}))
        });

    let flow = new_flow(&workspace.id, &task.id, "editing_flow");
    let handle = h.runtime.start_flow(flow.clone(), true).await.unwrap();
    let result = handle.join.await.unwrap().unwrap();
    assert_eq!(result["worktree"], "sidekick/feature-x");

    // The worktree row is stored under (workspace, flow).
    let worktrees = h
        .storage
        .list_worktrees_by_flow(&workspace.id, &flow.id)
        .await
        .unwrap();
    assert_eq!(worktrees.len(), 1);
    assert_eq!(worktrees[0].name, "sidekick/feature-x");

    // The chat delta landed on the action's sub-stream.
    let actions = h
        .storage
        .list_flow_actions(&workspace.id, &flow.id)
        .await
        .unwrap();
    let action_id = actions[0].id.clone();

    let cancel = CancellationToken::new();
    let (parents_tx, parents_rx) = mpsc::channel(4);
    let mut subscription = h
        .streamer
        .subscribe_flow_events(&workspace.id, &flow.id, "0", parents_rx, cancel.clone())
        .await
        .unwrap();
    parents_tx.send(action_id.clone()).await.unwrap();

    let delta = wait_for!({
        match tokio::time::timeout(Duration::from_millis(50), subscription.events.recv()).await {
            Ok(Some(envelope)) => match envelope.event {
                sidekick_domain::FlowEvent::ChatMessageDelta { delta, .. } => Some(delta),
                _ => None,
            },
            _ => None,
        }
    });
    assert_eq!(delta.text_delta.as_deref(), Some("Editing lib.rs"));

    cancel.cancel();
}

// =============================================================================
// Scenario: resumption replays recorded history without re-executing work
// =============================================================================

#[tokio::test]
async fn test_resume_replays_recorded_activities() {
    let h = harness();
    let workspace = seed_workspace(&h).await;
    let task = seed_task(&h, &workspace.id).await;

    let live_runs = Arc::new(AtomicU32::new(0));
    let live_runs_in_flow = live_runs.clone();

    h.runtime
        .register("replayable_flow", move |ctx: FlowContext| {
            let live_runs = live_runs_in_flow.clone();
            async move {
                let stamp = ctx.now().await?;
                let id = ctx.new_id(prefixes::WORKTREE).await?;
                let computed: serde_json::Value = ctx
                    .activity("compute", ActivityOptions::default(), || {
                        let live_runs = live_runs.clone();
                        async move {
                            live_runs.fetch_add(1, Ordering::SeqCst);
                            Ok(json!(41 + 1))
                        }
                    })
                    .await?;
                Ok(json!({
                    "stamp": stamp.to_rfc3339(),
                    "worktree": id.to_string(),
                    "computed": computed,
                }))
            }
        });

    let flow = new_flow(&workspace.id, &task.id, "replayable_flow");
    let handle = h.runtime.start_flow(flow.clone(), true).await.unwrap();
    let first = handle.join.await.unwrap().unwrap();
    assert_eq!(live_runs.load(Ordering::SeqCst), 1);

    // Re-execute against the recorded history: identical output, no second
    // live run of the activity, identical recorded side effects.
    let resumed = h
        .runtime
        .resume_flow(&workspace.id, &flow.id, true)
        .await
        .unwrap();
    let second = resumed.join.await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(live_runs.load(Ordering::SeqCst), 1);
}
