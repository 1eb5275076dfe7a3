//! C2 — stable reference IDs for messages and compressed blocks.
//!
//! Refs are what gets injected into the rewritten prompt so the model can
//! point back at earlier content across turns: `m0001` for a message,
//! `b1` for a compressed block. They're stable for the lifetime of a
//! session and restart at `m0001` after a compaction reset.

use std::collections::HashMap;

use regex::Regex;
use std::sync::OnceLock;

use crate::session::CompressSummary;

fn message_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^m(\d+)$").unwrap())
}

fn block_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^b(\d+)$").unwrap())
}

fn wrapper_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<dcp-message-id>(.*)</dcp-message-id>$").unwrap())
}

/// A resolved boundary reference, as accepted by `parseBoundaryId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryRef {
    Message(String),
    Block(u32),
}

/// Per-session registry of raw-id ↔ ref mappings. Message refs are
/// 1-based (`m0001`, `m0002`, …), per spec.md §4.2 and S4.
#[derive(Debug, Clone)]
pub struct IdRegistry {
    by_raw: HashMap<String, String>,
    by_ref: HashMap<String, String>,
    next_ref: u32,
}

impl Default for IdRegistry {
    fn default() -> Self {
        Self {
            by_raw: HashMap::new(),
            by_ref: HashMap::new(),
            next_ref: 1,
        }
    }
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: returns the existing ref for `raw_message_id` if one was
    /// already assigned, otherwise allocates the next one.
    pub fn assign_message_ref(&mut self, raw_message_id: &str) -> String {
        if let Some(existing) = self.by_raw.get(raw_message_id) {
            return existing.clone();
        }
        let ref_id = format!("m{:04}", self.next_ref);
        self.next_ref += 1;
        self.by_raw
            .insert(raw_message_id.to_string(), ref_id.clone());
        self.by_ref
            .insert(ref_id.clone(), raw_message_id.to_string());
        ref_id
    }

    pub fn lookup_raw_id(&self, message_ref: &str) -> Option<&str> {
        self.by_ref.get(message_ref).map(String::as_str)
    }

    /// Accepts `mNNNN`, `bN`, or either wrapped in a
    /// `<dcp-message-id>...</dcp-message-id>` tag.
    pub fn parse_boundary_id(input: &str) -> Option<BoundaryRef> {
        let trimmed = input.trim();
        let unwrapped = wrapper_tag_re()
            .captures(trimmed)
            .map(|c| c.get(1).unwrap().as_str())
            .unwrap_or(trimmed);

        if let Some(caps) = message_ref_re().captures(unwrapped) {
            return Some(BoundaryRef::Message(format!("m{}", &caps[1])));
        }
        if let Some(caps) = block_ref_re().captures(unwrapped) {
            return caps[1].parse::<u32>().ok().map(BoundaryRef::Block);
        }
        None
    }

    /// One greater than the current maximum block ID among `existing`, or 1
    /// if there are none. Block IDs only ever increase, which is what keeps
    /// placeholder resolution a DAG — a block can only reference a lower one.
    pub fn allocate_block_id(existing: &[CompressSummary]) -> u32 {
        existing.iter().map(|s| s.block_id).max().map_or(1, |m| m + 1)
    }

    /// Called on a compaction reset: refs are never reused, but numbering
    /// restarts at `m0001` for the fresh session.
    pub fn reset(&mut self) {
        self.by_raw.clear();
        self.by_ref.clear();
        self.next_ref = 1;
    }

    pub fn next_ref(&self) -> u32 {
        self.next_ref
    }

    /// Invariant #2 in spec.md §8: every ref in `by_ref` has an inverse in
    /// `by_raw`, and vice versa.
    pub fn is_consistent(&self) -> bool {
        self.by_raw.len() == self.by_ref.len()
            && self
                .by_raw
                .iter()
                .all(|(raw, r)| self.by_ref.get(r).map(String::as_str) == Some(raw.as_str()))
    }
}
