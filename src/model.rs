//! The conversation data model the engine reads from the host.
//!
//! Messages and parts are read-only as far as the engine is concerned — the
//! host owns them. The engine never mutates a `Message` in place; it builds
//! a new outbound view (see `rewrite`).

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// A single message in the conversation, as reported by the host.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub created: DateTime<Utc>,
    /// True for an assistant message that rolls up prior history — a
    /// "compacted message" per the glossary. Triggers a session reset.
    pub summary: bool,
    /// True for a message the rewriter should never assign a ref to or use
    /// as a compress boundary — reminders, nudges, and other host-generated
    /// filler. Set by the host; the engine only reads it.
    pub ignored: bool,
    pub parts: Vec<Part>,
}

impl Message {
    /// Total `step-start` parts in this message — one per model turn.
    pub fn turn_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::StepStart))
            .count()
    }
}

/// A content block within a message.
#[derive(Debug, Clone)]
pub enum Part {
    Text { text: String, synthetic: bool },
    Reasoning { text: String },
    Tool(ToolPart),
    File { attachment_id: String, meta: Value },
    StepStart,
    StepFinish,
    Patch,
    Snapshot,
    Agent,
    Retry,
    Compaction,
    /// Anything the engine doesn't need to interpret, kept for round-tripping.
    Other { kind: String, value: Value },
}

/// A tool invocation and its current lifecycle state.
#[derive(Debug, Clone)]
pub struct ToolPart {
    pub call_id: String,
    pub tool: String,
    pub state: ToolState,
}

/// Lifecycle of a single tool call, mirroring the host's tagged union.
#[derive(Debug, Clone)]
pub enum ToolState {
    Pending {
        input: Value,
        raw: Option<String>,
    },
    Running {
        input: Value,
        title: Option<String>,
        started: DateTime<Utc>,
    },
    Completed {
        input: Value,
        output: String,
        title: Option<String>,
        time: DateTime<Utc>,
        attachments: Vec<String>,
    },
    Error {
        input: Value,
        error: String,
        time: DateTime<Utc>,
    },
}
