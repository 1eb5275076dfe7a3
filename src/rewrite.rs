//! C8 — message rewriter: turns the host's raw message list into the
//! outbound view the model actually sees.
//!
//! Never mutates the host's `Message`/`Part` values; it builds a new
//! sequence of [`OutboundMessage`]s, consulting (and growing) the id
//! registry and reading the prune/compress state to decide what to tag,
//! splice, or redact.

use crate::config::EngineConfig;
use crate::model::{Message, Part, Role, ToolState};
use crate::session::SessionState;

pub const BLOCK_TAG_OPEN: &str = "<dcp-message-id>";
pub const BLOCK_TAG_CLOSE: &str = "</dcp-message-id>";

/// One part of a retained (non-redacted) outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPart {
    Text(String),
    Reasoning(String),
    /// A tool call, with its output either shown in full or replaced by
    /// the compact placeholder C6 decided on.
    Tool { call_id: String, tool: String, output: ToolOutputView },
    /// Everything the rewriter doesn't need to transform — passed
    /// through unlabeled (step markers, patches, snapshots, ...).
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutputView {
    Full(String),
    Pruned(String),
}

/// The rewriter's verdict for one message's body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundBody {
    Parts(Vec<OutboundPart>),
    /// Whole message replaced per `prune.messages`.
    PrunedWhole(String),
    /// This message anchored a compress summary; its body is the
    /// synthesized block text (already carries its own `bN` tag).
    CompressedBlock(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// `mNNNN` normally, or `bN` when this position was replaced by a
    /// compressed block.
    pub ref_id: String,
    pub role: Role,
    pub body: OutboundBody,
}

impl OutboundMessage {
    /// Render to the tagged text form the model actually reads. Blocks
    /// already embed their own tag; everything else gets `ref_id` wrapped
    /// in a `<dcp-message-id>` tag ahead of the body.
    pub fn render(&self) -> String {
        match &self.body {
            OutboundBody::CompressedBlock(text) => text.clone(),
            OutboundBody::PrunedWhole(text) => {
                format!("{BLOCK_TAG_OPEN}{}{BLOCK_TAG_CLOSE}\n{text}", self.ref_id)
            }
            OutboundBody::Parts(parts) => {
                let body = parts
                    .iter()
                    .filter_map(|p| match p {
                        OutboundPart::Text(t) | OutboundPart::Reasoning(t) => Some(t.clone()),
                        OutboundPart::Tool { tool, output, .. } => Some(match output {
                            ToolOutputView::Full(out) => format!("[{tool}] {out}"),
                            ToolOutputView::Pruned(stub) => stub.clone(),
                        }),
                        OutboundPart::Passthrough => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{BLOCK_TAG_OPEN}{}{BLOCK_TAG_CLOSE}\n{body}", self.ref_id)
            }
        }
    }
}

fn tool_output_text(state: &ToolState) -> String {
    match state {
        ToolState::Pending { .. } => String::new(),
        ToolState::Running { .. } => String::new(),
        ToolState::Completed { output, .. } => output.clone(),
        ToolState::Error { error, .. } => error.clone(),
    }
}

/// Produces the outbound view of `messages` given the session's current
/// prune/compress state. Pure with respect to `messages` (read-only);
/// mutates only `state.ids` (idempotent ref assignment), which is why
/// running this twice with no intervening events is a no-op on the
/// output (invariant #7 in spec.md §8).
pub fn rewrite_prompt(state: &mut SessionState, messages: &[Message], _config: &EngineConfig) -> Vec<OutboundMessage> {
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        if message.ignored {
            continue;
        }

        let message_ref = state.ids.assign_message_ref(&message.id);

        if let Some(summary) = state
            .compress_summaries
            .iter()
            .find(|s| s.anchor_message_id == message.id)
        {
            out.push(OutboundMessage {
                ref_id: format!("b{}", summary.block_id),
                role: message.role,
                body: OutboundBody::CompressedBlock(summary.summary.clone()),
            });
            continue;
        }

        if let Some(saved) = state.prune.messages.get(&message.id) {
            out.push(OutboundMessage {
                ref_id: message_ref.clone(),
                role: message.role,
                body: OutboundBody::PrunedWhole(format!(
                    "[pruned message {message_ref}, saved ~{saved} tokens]"
                )),
            });
            continue;
        }

        let parts = message
            .parts
            .iter()
            .map(|part| render_part(state, part))
            .collect();

        out.push(OutboundMessage {
            ref_id: message_ref,
            role: message.role,
            body: OutboundBody::Parts(parts),
        });
    }

    out
}

fn render_part(state: &SessionState, part: &Part) -> OutboundPart {
    match part {
        Part::Text { text, .. } => OutboundPart::Text(text.clone()),
        Part::Reasoning { text } => OutboundPart::Reasoning(text.clone()),
        Part::Tool(tool_part) => {
            let output = if let Some(saved) = state.prune.tools.get(&tool_part.call_id) {
                ToolOutputView::Pruned(format!(
                    "[pruned: {} call {}, saved ~{saved} tokens]",
                    tool_part.tool, tool_part.call_id
                ))
            } else {
                ToolOutputView::Full(tool_output_text(&tool_part.state))
            };
            OutboundPart::Tool {
                call_id: tool_part.call_id.clone(),
                tool: tool_part.tool.clone(),
                output,
            }
        }
        _ => OutboundPart::Passthrough,
    }
}
