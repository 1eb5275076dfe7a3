//! C1 — token accounting.
//!
//! Pure, deterministic, heuristic. Not a real tokenizer — bytes/4 is close
//! enough to the host's own counter (within about 15%) to make prune and
//! compaction decisions correctly under either measurement.

use serde_json::Value;

use crate::model::{Message, Part, ToolState};

/// Estimate the token count of a plain string.
pub fn estimate_str_tokens(s: &str, bytes_per_token: u32) -> u32 {
    (s.len() as u32) / bytes_per_token.max(1)
}

/// Estimate the token count of an arbitrary JSON-serializable value by
/// serializing to canonical JSON and applying the bytes-per-token ratio.
pub fn count_value_tokens(value: &Value, bytes_per_token: u32) -> u32 {
    estimate_str_tokens(&value.to_string(), bytes_per_token)
}

/// Sum text, reasoning, tool input+output, and file metadata tokens for a
/// whole message.
pub fn count_message_text_tokens(message: &Message, bytes_per_token: u32) -> u32 {
    message
        .parts
        .iter()
        .map(|part| count_part_tokens(part, bytes_per_token))
        .sum()
}

fn count_part_tokens(part: &Part, bytes_per_token: u32) -> u32 {
    match part {
        Part::Text { text, .. } => estimate_str_tokens(text, bytes_per_token),
        Part::Reasoning { text } => estimate_str_tokens(text, bytes_per_token),
        Part::Tool(tool_part) => match &tool_part.state {
            ToolState::Pending { input, .. } => count_value_tokens(input, bytes_per_token),
            ToolState::Running { input, .. } => count_value_tokens(input, bytes_per_token),
            ToolState::Completed { input, output, .. } => {
                count_value_tokens(input, bytes_per_token)
                    + estimate_str_tokens(output, bytes_per_token)
            }
            ToolState::Error { input, error, .. } => {
                count_value_tokens(input, bytes_per_token) + estimate_str_tokens(error, bytes_per_token)
            }
        },
        Part::File { meta, .. } => count_value_tokens(meta, bytes_per_token),
        Part::StepStart
        | Part::StepFinish
        | Part::Patch
        | Part::Snapshot
        | Part::Agent
        | Part::Retry
        | Part::Compaction => 0,
        Part::Other { value, .. } => count_value_tokens(value, bytes_per_token),
    }
}
