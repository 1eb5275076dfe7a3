//! C3 — per-session in-memory state and its lifecycle.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::config::EngineConfig;
use crate::host::HostApi;
use crate::ids::IdRegistry;
use crate::model::{Message, Role};
use crate::persist;

/// `prune.tools` / `prune.messages` — id → tokens saved by pruning it.
#[derive(Debug, Clone, Default)]
pub struct PruneState {
    pub tools: HashMap<String, u64>,
    pub messages: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub prune_token_counter: u64,
    pub total_prune_tokens: u64,
}

/// A compressed range of the conversation, identified by `blockId`.
#[derive(Debug, Clone)]
pub struct CompressSummary {
    pub block_id: u32,
    pub anchor_message_id: String,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct ToolParamEntry {
    pub tool: String,
    pub parameters: Value,
    pub status: ToolStatus,
    pub error: Option<String>,
    pub turn: usize,
    pub token_count: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PendingManualTrigger {
    pub session_id: String,
    pub prompt: String,
}

/// One per live session. Owns its child maps and sequences exclusively —
/// nothing outside holds a reference into them.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub is_sub_agent: bool,
    pub manual_mode: bool,
    pub pending_manual_trigger: Option<PendingManualTrigger>,
    pub prune: PruneState,
    pub compress_summaries: Vec<CompressSummary>,
    pub stats: Stats,
    pub tool_parameters: HashMap<String, ToolParamEntry>,
    pub tool_id_list: Vec<String>,
    pub ids: IdRegistry,
    pub nudge_counter: u32,
    pub last_tool_prune: Option<DateTime<Utc>>,
    pub last_compaction: Option<DateTime<Utc>>,
    pub current_turn: usize,
    pub variant: Option<String>,
    pub model_context_limit: Option<u32>,
    pub session_name: Option<String>,

    /// Role lookup used by the event router to tell whether a
    /// `message.part.updated` event belongs to a user message (dropped
    /// from the rewriter but still counted for turns).
    pub message_roles: HashMap<String, Role>,
    /// Dedup sets so repeated delivery of the same event is a no-op.
    pub seen_permission_requests: HashSet<String>,
    pub seen_questions: HashSet<String>,
    pub seen_attachments: HashSet<String>,
}

impl SessionState {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            is_sub_agent: false,
            manual_mode: false,
            pending_manual_trigger: None,
            prune: PruneState::default(),
            compress_summaries: Vec::new(),
            stats: Stats::default(),
            tool_parameters: HashMap::new(),
            tool_id_list: Vec::new(),
            ids: IdRegistry::new(),
            nudge_counter: 0,
            last_tool_prune: None,
            last_compaction: None,
            current_turn: 0,
            variant: None,
            model_context_limit: None,
            session_name: None,
            message_roles: HashMap::new(),
            seen_permission_requests: HashSet::new(),
            seen_questions: HashSet::new(),
            seen_attachments: HashSet::new(),
        }
    }

    /// Reset on compaction: clears everything compaction-sensitive but
    /// keeps `session_id`.
    pub fn reset_on_compaction(&mut self) {
        self.tool_parameters.clear();
        self.tool_id_list.clear();
        self.prune = PruneState::default();
        self.compress_summaries.clear();
        self.ids.reset();
        self.message_roles.clear();
        self.pending_manual_trigger = None;
    }

    /// Total saved tokens must equal the sum of every prune credit
    /// recorded so far.
    pub fn prune_totals_consistent(&self) -> bool {
        let sum: u64 = self.prune.tools.values().sum::<u64>() + self.prune.messages.values().sum::<u64>();
        self.stats.total_prune_tokens == sum
    }

    /// Block IDs must be strictly increasing, with no duplicates.
    pub fn summaries_well_ordered(&self) -> bool {
        self.compress_summaries
            .windows(2)
            .all(|w| w[0].block_id < w[1].block_id)
    }
}

/// Per-session lock pair: the state itself, and a separate lock so
/// concurrent persistence writes for one session serialize without
/// blocking state mutation. `cancel` mirrors the teacher's
/// `Agent::invoke_with_cancel` token: the host's per-session event reader
/// cancels it on abort, and planner entry points check it first so
/// in-flight work for that session is discarded rather than completed.
pub struct SessionHandle {
    pub state: Mutex<SessionState>,
    pub write_lock: Mutex<()>,
    pub cancel: CancellationToken,
}

impl SessionHandle {
    fn fresh(session_id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState::new(session_id)),
            write_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }
}

/// Owns the session-id → state table and the session check-in entry point
/// run before every rewrite.
pub struct SessionStore {
    host: Arc<dyn HostApi>,
    storage_root: PathBuf,
    config: EngineConfig,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionStore {
    pub fn new(host: Arc<dyn HostApi>, config: EngineConfig) -> Self {
        let storage_root = persist::resolve_storage_root(&config);
        Self {
            host,
            storage_root,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage_root(&self) -> &std::path::Path {
        &self.storage_root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cooperative shutdown for one session (spec.md §5): ask the host to
    /// abort, then cancel the session's token so any planner entry point
    /// already holding or about to take the state lock discards its work
    /// instead of completing it. A no-op if the session has no handle yet.
    pub async fn cancel_session(&self, session_id: &str) {
        if let Err(e) = self.host.session_abort(session_id).await {
            warn!(session_id, error = %e, "host session abort failed");
        }
        let sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(session_id) {
            handle.cancel.cancel();
        }
    }

    /// Returns the handle for `session_id`, creating and loading it if this
    /// is the first time this process has seen it.
    pub async fn handle_for(&self, session_id: &str) -> Arc<SessionHandle> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(h) = sessions.get(session_id) {
                return Arc::clone(h);
            }
        }

        let handle = SessionHandle::fresh(Some(session_id.to_string()));
        self.initialize(session_id, &handle).await;

        let mut sessions = self.sessions.lock().await;
        // Another caller may have raced us; keep whichever landed first.
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert(handle),
        )
    }

    async fn initialize(&self, session_id: &str, handle: &Arc<SessionHandle>) {
        let span = info_span!("session", session_id);
        let _enter = span.enter();

        let is_sub_agent = match self.host.session_get(session_id).await {
            Ok(info) => info.is_sub_agent,
            Err(e) => {
                warn!(error = %e, "sub-agent detection failed, assuming not a sub-agent");
                false
            }
        };

        let mut state = handle.state.lock().await;
        state.is_sub_agent = is_sub_agent;

        match persist::load(&self.storage_root, session_id).await {
            Ok(Some(persisted)) => {
                persist::apply_persisted(&mut state, persisted);
                info!("loaded persisted session state");
            }
            Ok(None) => debug!("no persisted state for session"),
            Err(e) => warn!(error = %e, "failed to load persisted session state"),
        }
    }

    /// The `checkSession` entry point, run before every rewrite.
    ///
    /// Returns `None` when there is no user message yet (nothing to do).
    pub async fn check_session(
        &self,
        messages: &[Message],
    ) -> Option<Arc<SessionHandle>> {
        let last_user = messages.iter().rev().find(|m| m.role == Role::User)?;
        let session_id = last_user.session_id.clone();
        let handle = self.handle_for(&session_id).await;

        let mut state = handle.state.lock().await;

        // Compaction detection: newest assistant message with summary=true.
        let newest_compaction = messages
            .iter()
            .filter(|m| m.role == Role::Assistant && m.summary)
            .max_by_key(|m| m.created);

        // `last_compaction` is persisted (see persist.rs), so a reload from
        // disk carries forward the compaction it already reset against — a
        // `None` here only ever means this session has truly never seen
        // one, and per spec.md S4 that first compaction is the one that
        // must trigger the reset, same as any later one.
        if newest_compaction.is_some_and(|m| Some(m.created) > state.last_compaction) {
            let m = newest_compaction.unwrap();
            info!(session_id = %session_id, "compaction detected, resetting session state");
            state.reset_on_compaction();
            state.last_compaction = Some(m.created);
            drop(state);
            self.checkpoint(&handle, &session_id).await;
            state = handle.state.lock().await;
        }

        state.current_turn = messages
            .iter()
            .filter(|m| !m.summary)
            .map(|m| m.turn_count())
            .sum();

        drop(state);
        Some(handle)
    }

    /// Snapshot + background write. Writes for the same session are
    /// serialized by `handle.write_lock`; the snapshot itself is taken
    /// under the state lock only long enough to clone it.
    pub async fn checkpoint(&self, handle: &Arc<SessionHandle>, session_id: &str) {
        let snapshot = {
            let state = handle.state.lock().await;
            persist::to_persisted(&state)
        };

        let root = self.storage_root.clone();
        let sid = session_id.to_string();
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            let _guard = handle.write_lock.lock().await;
            if let Err(e) = persist::save(&root, &sid, &snapshot).await {
                warn!(session_id = %sid, error = %e, "failed to persist session state");
            }
        });
    }
}
