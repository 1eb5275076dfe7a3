//! C7 — compression planner: implements the `compress` meta-tool the
//! model itself may call to fold a range of the conversation into a
//! durable summary, optionally absorbing earlier summaries in the range.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::DcpError;
use crate::ids::{BoundaryRef, IdRegistry};
use crate::model::Message;
use crate::session::{CompressSummary, SessionState};
use crate::tokens;

const HEADER: &str = "[Compressed conversation section]";

fn placeholder_paren_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(b(\d+)\)").unwrap())
}

fn placeholder_brace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{block_(\d+)\}").unwrap())
}

/// Arguments to the `compress` meta-tool, validated in the order listed
/// in spec.md §4.7.
#[derive(Debug, Clone)]
pub struct CompressArgs {
    pub topic: String,
    pub start_id: String,
    pub end_id: String,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct CompressOutcome {
    pub block_id: u32,
    pub consumed_block_ids: Vec<u32>,
    pub pruned_count: usize,
}

/// Every placeholder occurrence in `text`, in order of appearance,
/// duplicates included — duplicate detection needs to see them all.
fn extract_placeholders(text: &str) -> Vec<u32> {
    let mut found = Vec::new();
    for caps in placeholder_paren_re().captures_iter(text) {
        if let Ok(n) = caps[1].parse() {
            found.push(n);
        }
    }
    for caps in placeholder_brace_re().captures_iter(text) {
        if let Ok(n) = caps[1].parse() {
            found.push(n);
        }
    }
    found
}

fn replace_placeholder(text: &str, block_id: u32, with: &str) -> String {
    let paren = Regex::new(&format!(r"\(b{block_id}\)")).unwrap();
    let brace = Regex::new(&format!(r"\{{block_{block_id}\}}")).unwrap();
    let replaced = paren.replace_all(text, regex::NoExpand(with));
    brace.replace_all(&replaced, regex::NoExpand(with)).into_owned()
}

/// Strips the `[Compressed conversation section]` header line and the
/// trailing `<dcp-message-id>bN</dcp-message-id>` footer line, leaving
/// just the summary body, for splicing into a new summary.
fn strip_header_footer(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.first().map(|l| l.trim() == HEADER).unwrap_or(false) {
        lines.remove(0);
    }
    if lines
        .last()
        .map(|l| l.trim().starts_with("<dcp-message-id>"))
        .unwrap_or(false)
    {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Position of `message_id` among the session's non-ignored messages, in
/// arrival order. This is the coordinate space boundary refs (both
/// message and block) are compared in.
fn raw_index_of(messages: &[Message], message_id: &str) -> Option<usize> {
    messages
        .iter()
        .filter(|m| !m.ignored)
        .position(|m| m.id == message_id)
}

enum Resolved {
    Message { message_id: String, raw_index: usize },
    Block { block_id: u32, raw_index: usize },
}

fn resolve_boundary(
    state: &SessionState,
    messages: &[Message],
    boundary: &str,
    label: &str,
    issues: &mut Vec<String>,
) -> Option<Resolved> {
    match IdRegistry::parse_boundary_id(boundary) {
        Some(BoundaryRef::Message(message_ref)) => match state.ids.lookup_raw_id(&message_ref) {
            Some(raw_id) => match raw_index_of(messages, raw_id) {
                Some(raw_index) => Some(Resolved::Message {
                    message_id: raw_id.to_string(),
                    raw_index,
                }),
                None => {
                    issues.push(format!(
                        "{label} {boundary} refers to a message no longer in the conversation"
                    ));
                    None
                }
            },
            None => {
                issues.push(format!(
                    "{label} {boundary} is not available in the current conversation context"
                ));
                None
            }
        },
        Some(BoundaryRef::Block(block_id)) => {
            match state.compress_summaries.iter().find(|s| s.block_id == block_id) {
                Some(summary) => match raw_index_of(messages, &summary.anchor_message_id) {
                    Some(raw_index) => Some(Resolved::Block { block_id, raw_index }),
                    None => {
                        issues.push(format!(
                            "{label} b{block_id}'s anchor message is no longer in the conversation"
                        ));
                        None
                    }
                },
                None => {
                    issues.push(format!(
                        "{label} b{block_id} is not available in the current conversation context"
                    ));
                    None
                }
            }
        }
        None => {
            issues.push(format!("{label} {boundary} is not a valid message or block id"));
            None
        }
    }
}

/// Runs the full `compress` algorithm from spec.md §4.7. On success,
/// mutates `state` (absorbed summaries replaced by the new one, ranged
/// messages/tools added to the prune maps) and returns the outcome. On
/// any validation failure, `state` is left untouched and every issue
/// found is joined into a single [`DcpError::Validation`].
pub fn run_compress(
    state: &mut SessionState,
    messages: &[Message],
    args: CompressArgs,
    config: &EngineConfig,
) -> Result<CompressOutcome, DcpError> {
    let mut issues = Vec::new();

    if args.topic.trim().is_empty() {
        issues.push("topic must not be empty".to_string());
    }
    if args.summary.trim().is_empty() {
        issues.push("content.summary must not be empty".to_string());
    }

    let start = resolve_boundary(state, messages, &args.start_id, "startId", &mut issues);
    let end = resolve_boundary(state, messages, &args.end_id, "endId", &mut issues);

    if !issues.is_empty() {
        return Err(DcpError::Validation(issues));
    }
    let start = start.unwrap();
    let end = end.unwrap();

    let (start_idx, start_block_id) = match &start {
        Resolved::Message { raw_index, .. } => (*raw_index, None),
        Resolved::Block { raw_index, block_id } => (*raw_index, Some(*block_id)),
    };
    let (end_idx, end_block_id) = match &end {
        Resolved::Message { raw_index, .. } => (*raw_index, None),
        Resolved::Block { raw_index, block_id } => (*raw_index, Some(*block_id)),
    };

    if start_idx > end_idx {
        return Err(DcpError::Validation(vec![
            "startId must resolve to a position at or before endId".to_string(),
        ]));
    }
    if start_idx == end_idx && start_block_id.is_some() && end_block_id.is_some() {
        return Err(DcpError::Validation(vec![
            "selected range contains only compressed blocks, no raw messages to compress".to_string(),
        ]));
    }

    let non_ignored: Vec<&Message> = messages.iter().filter(|m| !m.ignored).collect();
    let range: Vec<&Message> = non_ignored[start_idx..=end_idx].to_vec();

    let boundary_block_ids: HashSet<u32> = [start_block_id, end_block_id].into_iter().flatten().collect();

    let required_block_ids: HashSet<u32> = state
        .compress_summaries
        .iter()
        .filter_map(|s| {
            raw_index_of(messages, &s.anchor_message_id).and_then(|idx| {
                if idx >= start_idx && idx <= end_idx {
                    Some(s.block_id)
                } else {
                    None
                }
            })
        })
        .collect();

    let must_appear: HashSet<u32> = required_block_ids.difference(&boundary_block_ids).copied().collect();

    let parsed = extract_placeholders(&args.summary);
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for id in &parsed {
        if !seen.insert(*id) && !duplicates.contains(id) {
            duplicates.push(*id);
        }
    }
    if !duplicates.is_empty() {
        duplicates.sort_unstable();
        issues.push(format!(
            "duplicate block placeholders: {}",
            duplicates.iter().map(|b| format!("b{b}")).collect::<Vec<_>>().join(", ")
        ));
    }

    let parsed_set: HashSet<u32> = parsed.iter().copied().collect();
    let unknown: Vec<u32> = parsed_set.difference(&required_block_ids).copied().collect();
    if !unknown.is_empty() {
        issues.push("invalid block placeholders for selected range".to_string());
    }

    let mut missing: Vec<u32> = must_appear.difference(&parsed_set).copied().collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        issues.push(format!(
            "summary is missing required block placeholder(s): {}",
            missing.iter().map(|b| format!("b{b}")).collect::<Vec<_>>().join(", ")
        ));
    }

    if !issues.is_empty() {
        return Err(DcpError::Validation(issues));
    }

    // --- everything validated; apply ---

    let mut body = args.summary.clone();
    let mut ordered_required: Vec<u32> = required_block_ids.iter().copied().collect();
    ordered_required.sort_unstable();
    for block_id in &ordered_required {
        let summary_text = state
            .compress_summaries
            .iter()
            .find(|s| s.block_id == *block_id)
            .map(|s| s.summary.clone())
            .unwrap_or_default();
        let stripped = strip_header_footer(&summary_text);

        if parsed_set.contains(block_id) {
            body = replace_placeholder(&body, *block_id, &stripped);
        } else if Some(*block_id) == start_block_id {
            body = format!("{stripped}\n\n{body}");
        } else if Some(*block_id) == end_block_id {
            body = format!("{body}\n\n{stripped}");
        }
    }

    let new_block_id = IdRegistry::allocate_block_id(&state.compress_summaries);
    let final_summary = format!("{HEADER}\n{body}\n<dcp-message-id>b{new_block_id}</dcp-message-id>");

    let anchor_message_id = match &start {
        Resolved::Message { message_id, .. } => message_id.to_string(),
        Resolved::Block { block_id, .. } => state
            .compress_summaries
            .iter()
            .find(|s| s.block_id == *block_id)
            .map(|s| s.anchor_message_id.clone())
            .unwrap_or_default(),
    };

    let mut consumed_credit: u64 = 0;
    for block_id in &ordered_required {
        if let Some(summary) = state.compress_summaries.iter().find(|s| s.block_id == *block_id) {
            consumed_credit += tokens::estimate_str_tokens(&summary.summary, config.bytes_per_token) as u64;
        }
    }

    state
        .compress_summaries
        .retain(|s| !required_block_ids.contains(&s.block_id));
    state.compress_summaries.push(CompressSummary {
        block_id: new_block_id,
        anchor_message_id,
        summary: final_summary,
    });
    state.compress_summaries.sort_by_key(|s| s.block_id);

    let mut pruned_count = 0usize;
    let mut new_credit: u64 = consumed_credit;

    for message in &range {
        if !state.prune.messages.contains_key(&message.id) {
            let saved = tokens::count_message_text_tokens(message, config.bytes_per_token) as u64;
            state.prune.messages.insert(message.id.clone(), saved);
            new_credit += saved;
            pruned_count += 1;
        }
        for part in &message.parts {
            if let crate::model::Part::Tool(tool_part) = part {
                if !state.prune.tools.contains_key(&tool_part.call_id) {
                    let saved = state
                        .tool_parameters
                        .get(&tool_part.call_id)
                        .and_then(|e| e.token_count)
                        .unwrap_or(0) as u64;
                    state.prune.tools.insert(tool_part.call_id.clone(), saved);
                    new_credit += saved;
                }
            }
        }
    }

    state.stats.prune_token_counter += new_credit;
    state.stats.total_prune_tokens += new_credit;

    let mut consumed_block_ids: Vec<u32> = required_block_ids.into_iter().collect();
    consumed_block_ids.sort_unstable();

    info!(
        block_id = new_block_id,
        consumed = consumed_block_ids.len(),
        pruned_count,
        "compression applied"
    );

    Ok(CompressOutcome {
        block_id: new_block_id,
        consumed_block_ids,
        pruned_count,
    })
}
