//! C5 — tool-parameter cache: records every tool invocation the host
//! reports, keyed by `toolCallId`.
//!
//! Entries are never removed here. They go away as a side effect of a
//! compaction reset ([`crate::session::SessionState::reset_on_compaction`])
//! or of the prune planner deciding they're no longer referenced.

use serde_json::Value;
use tracing::debug;

use crate::session::{SessionState, ToolParamEntry, ToolStatus};
use crate::tokens;

/// `tool-input-start`, or the earliest part carrying a `tool` type. A
/// no-op if an entry already exists for `call_id` — duplicate delivery of
/// the same event must be idempotent.
pub fn record_pending(
    state: &mut SessionState,
    call_id: &str,
    tool: &str,
    input: Value,
    bytes_per_token: u32,
) {
    if state.tool_parameters.contains_key(call_id) {
        return;
    }
    let token_count = tokens::count_value_tokens(&input, bytes_per_token);
    state.tool_id_list.push(call_id.to_string());
    state.tool_parameters.insert(
        call_id.to_string(),
        ToolParamEntry {
            tool: tool.to_string(),
            parameters: input,
            status: ToolStatus::Pending,
            error: None,
            turn: state.current_turn,
            token_count: Some(token_count),
        },
    );
}

/// Input growing as the host streams it in. Replaces `parameters`
/// wholesale with the latest value — the router already decided whether
/// this was a prefix-extending delta or a full replacement before calling
/// in; the cache only ever needs the final value.
pub fn record_running(
    state: &mut SessionState,
    call_id: &str,
    tool: &str,
    input: Value,
    bytes_per_token: u32,
) {
    let token_count = tokens::count_value_tokens(&input, bytes_per_token);
    match state.tool_parameters.get_mut(call_id) {
        Some(entry) => {
            entry.status = ToolStatus::Running;
            entry.parameters = input;
            entry.token_count = Some(token_count);
        }
        None => {
            state.tool_id_list.push(call_id.to_string());
            state.tool_parameters.insert(
                call_id.to_string(),
                ToolParamEntry {
                    tool: tool.to_string(),
                    parameters: input,
                    status: ToolStatus::Running,
                    error: None,
                    turn: state.current_turn,
                    token_count: Some(token_count),
                },
            );
        }
    }
}

/// True if `new` extends `old` as a plain string prefix — used by the
/// router to decide whether to emit a delta or the full input over the
/// wire. Non-string inputs are never considered prefix-extensions.
pub fn is_prefix_extension(old: &Value, new: &Value) -> bool {
    match (old.as_str(), new.as_str()) {
        (Some(o), Some(n)) => n.starts_with(o),
        _ => false,
    }
}

pub fn record_completed(
    state: &mut SessionState,
    call_id: &str,
    tool: &str,
    input: Value,
    output: &str,
    bytes_per_token: u32,
) {
    let token_count =
        tokens::count_value_tokens(&input, bytes_per_token) + tokens::estimate_str_tokens(output, bytes_per_token);
    match state.tool_parameters.get_mut(call_id) {
        Some(entry) => {
            entry.status = ToolStatus::Completed;
            entry.parameters = input;
            entry.error = None;
            entry.token_count = Some(token_count);
        }
        None => {
            state.tool_id_list.push(call_id.to_string());
            state.tool_parameters.insert(
                call_id.to_string(),
                ToolParamEntry {
                    tool: tool.to_string(),
                    parameters: input,
                    status: ToolStatus::Completed,
                    error: None,
                    turn: state.current_turn,
                    token_count: Some(token_count),
                },
            );
        }
    }
}

pub fn record_error(
    state: &mut SessionState,
    call_id: &str,
    tool: &str,
    input: Value,
    error: &str,
    bytes_per_token: u32,
) {
    debug!(call_id, tool, error, "tool call errored");
    let token_count =
        tokens::count_value_tokens(&input, bytes_per_token) + tokens::estimate_str_tokens(error, bytes_per_token);
    match state.tool_parameters.get_mut(call_id) {
        Some(entry) => {
            entry.status = ToolStatus::Error;
            entry.parameters = input;
            entry.error = Some(error.to_string());
            entry.token_count = Some(token_count);
        }
        None => {
            state.tool_id_list.push(call_id.to_string());
            state.tool_parameters.insert(
                call_id.to_string(),
                ToolParamEntry {
                    tool: tool.to_string(),
                    parameters: input,
                    status: ToolStatus::Error,
                    error: Some(error.to_string()),
                    turn: state.current_turn,
                    token_count: Some(token_count),
                },
            );
        }
    }
}
