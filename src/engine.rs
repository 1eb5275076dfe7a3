//! Top-level facade the host actually holds onto.
//!
//! Wires [`SessionStore`] + [`HostApi`] + [`EngineConfig`] behind the five
//! RPC-style entry points a host calls into (spec.md §6).

use std::sync::Arc;

use tracing::warn;

use crate::compress::{self, CompressArgs, CompressOutcome};
use crate::config::EngineConfig;
use crate::error::DcpError;
use crate::host::HostApi;
use crate::model::Message;
use crate::persist;
use crate::prune::{self, PruneOutcome};
use crate::rewrite::{self, OutboundMessage};
use crate::router::{self, HostEvent, RouteOutcome};
use crate::session::{PendingManualTrigger, SessionStore};

/// Aggregate counters across every persisted session, returned by
/// `statsAllSessions`.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub total_tokens: u64,
    pub total_tools: u64,
    pub total_messages: u64,
    pub session_count: u64,
}

/// The engine's single entry point for a host to embed.
pub struct DcpEngine {
    store: SessionStore,
}

impl DcpEngine {
    pub fn new(host: Arc<dyn HostApi>, config: EngineConfig) -> Self {
        Self {
            store: SessionStore::new(host, config),
        }
    }

    /// `onEvent` — routes one host event, running the prune planner and
    /// checkpointing at end-of-turn.
    pub async fn on_event(&self, event: HostEvent, messages: &[Message]) -> RouteOutcome {
        let session_id = match &event {
            HostEvent::MessagePartUpdated { session_id, .. }
            | HostEvent::MessageUpdated { session_id, .. }
            | HostEvent::SessionStatus { session_id, .. }
            | HostEvent::SessionIdle { session_id }
            | HostEvent::PermissionAsked { session_id, .. }
            | HostEvent::QuestionAsked { session_id, .. }
            | HostEvent::AttachmentAdded { session_id, .. } => Some(session_id.clone()),
            HostEvent::Other => None,
        };

        let outcome = router::dispatch(&self.store, event).await;

        if outcome == RouteOutcome::TurnEnded {
            if let Some(session_id) = session_id {
                router::run_end_of_turn(&self.store, &session_id, messages).await;
            }
        }

        outcome
    }

    /// `rewritePrompt` — the pre-prompt hook. Runs `checkSession` first so
    /// compaction/turn bookkeeping is current before the rewrite.
    pub async fn rewrite_prompt(&self, messages: &[Message]) -> Vec<OutboundMessage> {
        let Some(handle) = self.store.check_session(messages).await else {
            return Vec::new();
        };
        let mut state = handle.state.lock().await;
        rewrite::rewrite_prompt(&mut state, messages, self.store.config())
    }

    /// `runCompress` — handler for the compress meta-tool.
    pub async fn run_compress(
        &self,
        session_id: &str,
        messages: &[Message],
        args: CompressArgs,
    ) -> Result<CompressOutcome, DcpError> {
        let handle = self.store.handle_for(session_id).await;
        let outcome = {
            let mut state = handle.state.lock().await;
            compress::run_compress(&mut state, messages, args, self.store.config())?
        };
        self.store.checkpoint(&handle, session_id).await;
        Ok(outcome)
    }

    /// `runPrune` — handler for the manual prune tool. Arms the pending
    /// manual trigger for the duration of the planning pass so the
    /// manual-mode gate in [`crate::prune`] admits it, then clears it.
    pub async fn run_prune(&self, session_id: &str, messages: &[Message], prompt: &str) -> PruneOutcome {
        let handle = self.store.handle_for(session_id).await;
        let outcome = {
            let mut state = handle.state.lock().await;
            state.pending_manual_trigger = Some(PendingManualTrigger {
                session_id: session_id.to_string(),
                prompt: prompt.to_string(),
            });
            let outcome = prune::plan_and_apply(&mut state, messages, self.store.config());
            state.pending_manual_trigger = None;
            outcome
        };
        self.store.checkpoint(&handle, session_id).await;
        outcome
    }

    /// Cooperative shutdown for one session (spec.md §5): the host calls
    /// this when it aborts a running session. Issues the abort to the host
    /// and cancels the session's token so any planner pass already
    /// in-flight for it discards its work at the next checkpoint.
    pub async fn cancel_session(&self, session_id: &str) {
        self.store.cancel_session(session_id).await;
    }

    /// `statsAllSessions` — walks persisted session files under the
    /// configured storage root.
    pub async fn stats_all_sessions(&self) -> EngineStats {
        match persist::aggregate_stats(self.store.storage_root()).await {
            Ok(agg) => EngineStats {
                total_tokens: agg.total_prune_tokens,
                total_tools: agg.tool_count,
                total_messages: agg.message_count,
                session_count: agg.session_count,
            },
            Err(e) => {
                warn!(error = %e, "failed to aggregate session stats");
                EngineStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoopHost;
    use crate::model::{Part, Role};
    use chrono::Utc;

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

    #[tokio::test]
    async fn rewrite_prompt_returns_empty_without_a_user_message() {
        let engine = DcpEngine::new(Arc::new(NoopHost), EngineConfig::default());
        let out = engine.rewrite_prompt(&[]).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn rewrite_prompt_tags_a_single_message() {
        let engine = DcpEngine::new(Arc::new(NoopHost), EngineConfig::default());
        let messages = vec![user_message("m1", "s-1")];
        let out = engine.rewrite_prompt(&messages).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ref_id, "m0001");
    }

    #[tokio::test]
    async fn run_prune_arms_and_clears_manual_trigger() {
        let engine = DcpEngine::new(Arc::new(NoopHost), EngineConfig::default());
        let messages = vec![user_message("m1", "s-1")];
        engine.rewrite_prompt(&messages).await;

        let outcome = engine.run_prune("s-1", &messages, "prune now").await;
        assert!(outcome.pruned_tool_ids.is_empty());

        let handle = engine_handle(&engine, "s-1").await;
        let state = handle.state.lock().await;
        assert!(state.pending_manual_trigger.is_none());
    }

    async fn engine_handle(engine: &DcpEngine, session_id: &str) -> Arc<crate::session::SessionHandle> {
        engine.store.handle_for(session_id).await
    }
}
