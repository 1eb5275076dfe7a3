//! C9 — event router: the single entry point for host events.
//!
//! Mirrors the host's conversation-event vocabulary. Dispatches tool
//! lifecycle transitions into [`crate::toolcache`], triggers the prune
//! planner at end-of-turn, and de-duplicates permission/question/
//! attachment events so repeated delivery is a no-op.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::model::{Role, ToolState};
use crate::prune;
use crate::session::{SessionState, SessionStore};

/// Status carried by a `session.status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatusKind {
    Idle,
    Busy,
}

/// One tool part's lifecycle snapshot, as reported by a
/// `message.part.updated` event.
#[derive(Debug, Clone)]
pub struct ToolPartEvent {
    pub call_id: String,
    pub tool: String,
    pub input: Value,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// The event vocabulary this router accepts. `Other` covers anything the
/// host emits that the engine doesn't act on.
#[derive(Debug, Clone)]
pub enum HostEvent {
    MessagePartUpdated {
        session_id: String,
        message_id: String,
        role: Role,
        tool: Option<ToolPartEvent>,
    },
    MessageUpdated {
        session_id: String,
        message_id: String,
        role: Role,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatusKind,
    },
    SessionIdle {
        session_id: String,
    },
    PermissionAsked {
        session_id: String,
        request_id: String,
    },
    QuestionAsked {
        session_id: String,
        question_id: String,
    },
    AttachmentAdded {
        session_id: String,
        attachment_id: String,
    },
    Other,
}

/// Outcome of dispatching one event — what the caller (typically the
/// engine facade) needs to act on beyond mutating session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RouteOutcome {
    #[default]
    None,
    /// Surface a tool-approval-request for this permission request, once.
    PermissionRequested(String),
    /// The core cannot answer interactive questions; surface an error once.
    UnansweredQuestion(String),
    /// End-of-turn: caller should run the prune planner and checkpoint.
    TurnEnded,
}

/// Routes one event to the session it names. Returns `None` if the event
/// carries no session id the store has a handle for yet and isn't worth
/// creating one for (e.g. a bare `Other`).
pub async fn dispatch(
    store: &SessionStore,
    event: HostEvent,
) -> RouteOutcome {
    match event {
        HostEvent::Other => RouteOutcome::None,

        HostEvent::MessagePartUpdated {
            session_id,
            message_id,
            role,
            tool,
        } => {
            let handle = store.handle_for(&session_id).await;
            let mut state = handle.state.lock().await;
            state.message_roles.insert(message_id.clone(), role);

            if role == Role::User {
                // Dropped from the rewriter, but the turn counter already
                // accounts for it via `turn_count()` over step-start parts
                // at `check_session` time; nothing further to do here.
                return RouteOutcome::None;
            }

            let Some(tool_event) = tool else {
                return RouteOutcome::None;
            };
            dispatch_tool_part(&mut state, &tool_event, store.config());
            RouteOutcome::None
        }

        HostEvent::MessageUpdated {
            session_id,
            message_id,
            role,
        } => {
            let handle = store.handle_for(&session_id).await;
            let mut state = handle.state.lock().await;
            state.message_roles.insert(message_id, role);
            RouteOutcome::None
        }

        HostEvent::SessionStatus { session_id, status } => {
            if status != SessionStatusKind::Idle {
                return RouteOutcome::None;
            }
            let _ = store.handle_for(&session_id).await;
            RouteOutcome::TurnEnded
        }

        HostEvent::SessionIdle { session_id } => {
            let _ = store.handle_for(&session_id).await;
            RouteOutcome::TurnEnded
        }

        HostEvent::PermissionAsked {
            session_id,
            request_id,
        } => {
            let handle = store.handle_for(&session_id).await;
            let mut state = handle.state.lock().await;
            if !state.seen_permission_requests.insert(request_id.clone()) {
                return RouteOutcome::None;
            }
            RouteOutcome::PermissionRequested(request_id)
        }

        HostEvent::QuestionAsked {
            session_id,
            question_id,
        } => {
            let handle = store.handle_for(&session_id).await;
            let mut state = handle.state.lock().await;
            if !state.seen_questions.insert(question_id.clone()) {
                return RouteOutcome::None;
            }
            warn!(session_id = %session_id, question_id, "host asked an interactive question; core cannot answer");
            RouteOutcome::UnansweredQuestion(question_id)
        }

        HostEvent::AttachmentAdded {
            session_id,
            attachment_id,
        } => {
            let handle = store.handle_for(&session_id).await;
            let mut state = handle.state.lock().await;
            state.seen_attachments.insert(attachment_id);
            RouteOutcome::None
        }
    }
}

fn dispatch_tool_part(state: &mut SessionState, tool: &ToolPartEvent, config: &EngineConfig) {
    let bytes_per_token = config.bytes_per_token;

    if let Some(error) = &tool.error {
        info!(call_id = %tool.call_id, tool = %tool.tool, "tool call errored");
        crate::toolcache::record_error(state, &tool.call_id, &tool.tool, tool.input.clone(), error, bytes_per_token);
        return;
    }

    if let Some(output) = &tool.output {
        crate::toolcache::record_completed(
            state,
            &tool.call_id,
            &tool.tool,
            tool.input.clone(),
            output,
            bytes_per_token,
        );
        return;
    }

    match state.tool_parameters.get(&tool.call_id).map(|e| e.parameters.clone()) {
        None => crate::toolcache::record_pending(state, &tool.call_id, &tool.tool, tool.input.clone(), bytes_per_token),
        Some(previous) => {
            // spec.md §4.9: while running, emit a prefix-extending input
            // delta when the new input just grows the old one; otherwise
            // the change isn't representable as a delta, so fall back to
            // the full input.
            if crate::toolcache::is_prefix_extension(&previous, &tool.input) {
                debug!(call_id = %tool.call_id, tool = %tool.tool, "tool input extended as prefix delta");
            } else {
                debug!(call_id = %tool.call_id, tool = %tool.tool, "tool input changed non-prefix, emitting full input");
            }
            crate::toolcache::record_running(state, &tool.call_id, &tool.tool, tool.input.clone(), bytes_per_token);
        }
    }
}

/// Convenience conversion from the host's lifecycle tag for a tool part
/// into the flat [`ToolPartEvent`] the router understands.
pub fn tool_event_from_state(call_id: &str, tool: &str, state: &ToolState) -> ToolPartEvent {
    match state {
        ToolState::Pending { input, .. } => ToolPartEvent {
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            input: input.clone(),
            output: None,
            error: None,
        },
        ToolState::Running { input, .. } => ToolPartEvent {
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            input: input.clone(),
            output: None,
            error: None,
        },
        ToolState::Completed { input, output, .. } => ToolPartEvent {
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            input: input.clone(),
            output: Some(output.clone()),
            error: None,
        },
        ToolState::Error { input, error, .. } => ToolPartEvent {
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            input: input.clone(),
            output: None,
            error: Some(error.clone()),
        },
    }
}

/// Runs the prune planner for `session_id` and checkpoints the result.
/// The caller (engine facade) invokes this after a [`RouteOutcome::TurnEnded`].
pub async fn run_end_of_turn(
    store: &SessionStore,
    session_id: &str,
    messages: &[crate::model::Message],
) -> prune::PruneOutcome {
    let handle = store.handle_for(session_id).await;
    if handle.cancel.is_cancelled() {
        info!(session_id, "session cancelled, discarding pending planner work");
        return prune::PruneOutcome::default();
    }
    let outcome = {
        let mut state = handle.state.lock().await;
        prune::plan_and_apply(&mut state, messages, store.config())
    };
    store.checkpoint(&handle, session_id).await;
    outcome
}
