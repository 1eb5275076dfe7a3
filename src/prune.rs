//! C6 — prune planner: decides which tool calls and whole messages drop
//! out of the outbound context, and banks the token credit.

use std::collections::HashSet;

use tracing::debug;

use crate::config::EngineConfig;
use crate::model::{Message, Part, ToolState};
use crate::session::{SessionState, ToolStatus};
use crate::tokens;

/// What changed on this planning pass. Cumulative totals live on
/// [`crate::session::Stats`]; this is just the delta, useful for logging
/// and for the `runPrune` RPC's return value.
#[derive(Debug, Default, Clone)]
pub struct PruneOutcome {
    pub pruned_tool_ids: Vec<String>,
    pub pruned_message_ids: Vec<String>,
    pub tokens_saved: u64,
}

/// All IDs of tool calls a message carries, regardless of lifecycle state.
fn tool_call_ids(message: &Message) -> Vec<&str> {
    message
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::Tool(t) => Some(t.call_id.as_str()),
            _ => None,
        })
        .collect()
}

fn containing_message<'a>(messages: &'a [Message], call_id: &str) -> Option<&'a Message> {
    messages
        .iter()
        .find(|m| tool_call_ids(m).contains(&call_id))
}

/// Rule 4: an entry anchoring a live compress summary is left alone — the
/// rewriter already replaces that whole message with the block text, so
/// pruning its tool output piecemeal underneath it would be wasted work.
fn message_is_anchor(state: &SessionState, message_id: &str) -> bool {
    state
        .compress_summaries
        .iter()
        .any(|s| s.anchor_message_id == message_id)
}

/// Precedence rules from spec.md §4.6, all of which must hold for a tool
/// call to be pruneable. Pure so it's directly testable without needing a
/// whole session/message fixture.
fn tool_is_pruneable(
    state: &SessionState,
    messages: &[Message],
    call_id: &str,
    turn: usize,
    status: ToolStatus,
    prune_age_turns: usize,
) -> bool {
    if state.is_sub_agent {
        return false;
    }
    if state.manual_mode && state.pending_manual_trigger.is_none() {
        return false;
    }
    if status == ToolStatus::Error {
        return false;
    }
    if turn + prune_age_turns >= state.current_turn {
        return false;
    }
    match containing_message(messages, call_id) {
        Some(m) if message_is_anchor(state, &m.id) => false,
        _ => true,
    }
}

/// Runs one planning pass: prunes eligible tool outputs, then any message
/// that has become entirely redacted as a result. Idempotent — an id
/// already present in `prune.tools`/`prune.messages` is left untouched on
/// a second pass.
pub fn plan_and_apply(state: &mut SessionState, messages: &[Message], config: &EngineConfig) -> PruneOutcome {
    let mut outcome = PruneOutcome::default();

    if state.is_sub_agent {
        return outcome;
    }
    if state.manual_mode && state.pending_manual_trigger.is_none() {
        return outcome;
    }

    let call_ids: Vec<(String, usize, ToolStatus)> = state
        .tool_parameters
        .iter()
        .map(|(id, entry)| (id.clone(), entry.turn, entry.status))
        .collect();

    for (call_id, turn, status) in call_ids {
        if state.prune.tools.contains_key(&call_id) {
            continue;
        }
        if !tool_is_pruneable(state, messages, &call_id, turn, status, config.prune_age_turns) {
            continue;
        }

        let saved = state
            .tool_parameters
            .get(&call_id)
            .and_then(|e| e.token_count)
            .unwrap_or(0) as u64;

        let tool_name = state
            .tool_parameters
            .get(&call_id)
            .map(|e| e.tool.clone())
            .unwrap_or_default();

        debug!(call_id, tool = %tool_name, saved, "pruning tool output");
        state.prune.tools.insert(call_id.clone(), saved);
        state.stats.prune_token_counter += saved;
        state.stats.total_prune_tokens += saved;
        outcome.pruned_tool_ids.push(call_id);
        outcome.tokens_saved += saved;
    }

    for message in messages {
        if message.ignored || state.prune.messages.contains_key(&message.id) {
            continue;
        }
        if message_is_anchor(state, &message.id) {
            continue;
        }

        let ids = tool_call_ids(message);
        let has_content = message.parts.iter().any(|p| is_substantive(p));
        if !has_content {
            continue;
        }
        let fully_redacted = message.parts.iter().all(|p| match p {
            Part::Tool(t) => state.prune.tools.contains_key(&t.call_id),
            Part::Text { synthetic, .. } => *synthetic,
            Part::StepStart | Part::StepFinish => true,
            _ => false,
        });
        if !fully_redacted || ids.is_empty() {
            continue;
        }

        let saved = tokens::count_message_text_tokens(message, config.bytes_per_token) as u64;
        state.prune.messages.insert(message.id.clone(), saved);
        state.stats.prune_token_counter += saved;
        state.stats.total_prune_tokens += saved;
        outcome.pruned_message_ids.push(message.id.clone());
        outcome.tokens_saved += saved;
    }

    outcome
}

fn is_substantive(part: &Part) -> bool {
    matches!(part, Part::Tool(_) | Part::Text { .. } | Part::Reasoning { .. })
}

/// Every tool call id currently referenced by a tool part somewhere in
/// `messages` — used by callers that want to sanity-check that a prune
/// map entry still corresponds to something the host reported.
pub fn known_tool_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .flat_map(tool_call_ids)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, ToolPart};
    use crate::session::ToolParamEntry;
    use chrono::Utc;
    use serde_json::json;

    fn completed_tool_message(id: &str, session: &str, call_id: &str, output: &str) -> Message {
        Message {
            id: id.into(),
            session_id: session.into(),
            role: Role::Assistant,
            created: Utc::now(),
            summary: false,
            ignored: false,
            parts: vec![
                Part::StepStart,
                Part::Tool(ToolPart {
                    call_id: call_id.into(),
                    tool: "bash".into(),
                    state: ToolState::Completed {
                        input: json!({"cmd": "echo hi"}),
                        output: output.into(),
                        title: None,
                        time: Utc::now(),
                        attachments: vec![],
                    },
                }),
            ],
        }
    }

    fn user_message(id: &str, session: &str) -> Message {
        Message {
            id: id.into(),
            session_id: session.into(),
            role: Role::User,
            created: Utc::now(),
            summary: false,
            ignored: false,
            parts: vec![Part::Text {
                text: "hi".into(),
                synthetic: false,
            }],
        }
    }

    /// S1 from spec.md §8: two turns in, the older tool call prunes and the
    /// newer one doesn't.
    #[test]
    fn s1_prunes_aged_tool_not_the_fresh_one() {
        let mut state = SessionState::new(Some("s-1".into()));
        state.current_turn = 2;
        state.tool_parameters.insert(
            "c1".into(),
            ToolParamEntry {
                tool: "bash".into(),
                parameters: json!({"cmd": "echo hi"}),
                status: ToolStatus::Completed,
                error: None,
                turn: 0,
                token_count: Some(50),
            },
        );
        state.tool_parameters.insert(
            "c2".into(),
            ToolParamEntry {
                tool: "grep".into(),
                parameters: json!({}),
                status: ToolStatus::Completed,
                error: None,
                turn: 1,
                token_count: Some(20),
            },
        );
        let messages = vec![
            user_message("m1", "s-1"),
            completed_tool_message("m2", "s-1", "c1", "hello\nworld"),
            user_message("m3", "s-1"),
            completed_tool_message("m4", "s-1", "c2", "matched lines"),
        ];

        let config = EngineConfig::default();
        let outcome = plan_and_apply(&mut state, &messages, &config);

        assert_eq!(outcome.pruned_tool_ids, vec!["c1".to_string()]);
        assert!(state.prune.tools.contains_key("c1"));
        assert!(!state.prune.tools.contains_key("c2"));
        assert_eq!(state.stats.total_prune_tokens, 50);
    }

    #[test]
    fn sub_agent_sessions_never_prune() {
        let mut state = SessionState::new(Some("s-1".into()));
        state.is_sub_agent = true;
        state.current_turn = 5;
        state.tool_parameters.insert(
            "c1".into(),
            ToolParamEntry {
                tool: "bash".into(),
                parameters: json!({}),
                status: ToolStatus::Completed,
                error: None,
                turn: 0,
                token_count: Some(50),
            },
        );
        let messages = vec![completed_tool_message("m1", "s-1", "c1", "x")];
        let outcome = plan_and_apply(&mut state, &messages, &EngineConfig::default());
        assert!(outcome.pruned_tool_ids.is_empty());
    }

    #[test]
    fn manual_mode_requires_pending_trigger() {
        let mut state = SessionState::new(Some("s-1".into()));
        state.manual_mode = true;
        state.current_turn = 5;
        state.tool_parameters.insert(
            "c1".into(),
            ToolParamEntry {
                tool: "bash".into(),
                parameters: json!({}),
                status: ToolStatus::Completed,
                error: None,
                turn: 0,
                token_count: Some(50),
            },
        );
        let messages = vec![completed_tool_message("m1", "s-1", "c1", "x")];

        let outcome = plan_and_apply(&mut state, &messages, &EngineConfig::default());
        assert!(outcome.pruned_tool_ids.is_empty(), "no pending trigger yet");

        state.pending_manual_trigger = Some(crate::session::PendingManualTrigger {
            session_id: "s-1".into(),
            prompt: "prune".into(),
        });
        let outcome = plan_and_apply(&mut state, &messages, &EngineConfig::default());
        assert_eq!(outcome.pruned_tool_ids, vec!["c1".to_string()]);
    }

    #[test]
    fn error_status_tools_are_preserved() {
        let mut state = SessionState::new(Some("s-1".into()));
        state.current_turn = 5;
        state.tool_parameters.insert(
            "c1".into(),
            ToolParamEntry {
                tool: "bash".into(),
                parameters: json!({}),
                status: ToolStatus::Error,
                error: Some("boom".into()),
                turn: 0,
                token_count: Some(50),
            },
        );
        let messages = vec![completed_tool_message("m1", "s-1", "c1", "x")];
        let outcome = plan_and_apply(&mut state, &messages, &EngineConfig::default());
        assert!(outcome.pruned_tool_ids.is_empty());
    }

    #[test]
    fn idempotent_on_second_pass() {
        let mut state = SessionState::new(Some("s-1".into()));
        state.current_turn = 5;
        state.tool_parameters.insert(
            "c1".into(),
            ToolParamEntry {
                tool: "bash".into(),
                parameters: json!({}),
                status: ToolStatus::Completed,
                error: None,
                turn: 0,
                token_count: Some(50),
            },
        );
        let messages = vec![completed_tool_message("m1", "s-1", "c1", "x")];
        let config = EngineConfig::default();

        plan_and_apply(&mut state, &messages, &config);
        let totals_after_first = state.stats.total_prune_tokens;
        let second = plan_and_apply(&mut state, &messages, &config);

        assert!(second.pruned_tool_ids.is_empty());
        assert_eq!(state.stats.total_prune_tokens, totals_after_first);
    }

    #[test]
    fn anchored_message_is_left_alone() {
        let mut state = SessionState::new(Some("s-1".into()));
        state.current_turn = 5;
        state.compress_summaries.push(crate::session::CompressSummary {
            block_id: 1,
            anchor_message_id: "m1".into(),
            summary: "[Compressed conversation section]\nstuff\n<dcp-message-id>b1</dcp-message-id>".into(),
        });
        state.tool_parameters.insert(
            "c1".into(),
            ToolParamEntry {
                tool: "bash".into(),
                parameters: json!({}),
                status: ToolStatus::Completed,
                error: None,
                turn: 0,
                token_count: Some(50),
            },
        );
        let messages = vec![completed_tool_message("m1", "s-1", "c1", "x")];
        let outcome = plan_and_apply(&mut state, &messages, &EngineConfig::default());
        assert!(outcome.pruned_tool_ids.is_empty());
    }
}
