//! Engine configuration knobs.
//!
//! CLI/config-file parsing is out of scope — the host constructs this
//! programmatically and hands it to [`crate::DcpEngine`].

use std::path::PathBuf;

/// Tunables for the engine. Defaults are the values this implementation
/// settled on for the knobs left open to the implementer.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `K` — a tool/message entry becomes pruneable once
    /// `entry.turn < current_turn - prune_age_turns`.
    pub prune_age_turns: usize,
    /// Heuristic ratio used by the token estimator: bytes per token.
    pub bytes_per_token: u32,
    /// Override for the persistence root. When `None`, resolved from
    /// `XDG_DATA_HOME`/`HOME` at call time (see `persist::resolve_storage_root`).
    pub storage_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prune_age_turns: 1,
            bytes_per_token: 4,
            storage_root: None,
        }
    }
}
