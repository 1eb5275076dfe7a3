//! End-to-end scenarios from spec.md §8, driven through the public
//! `DcpEngine` facade rather than individual module internals.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dcp_engine::{
    CompressArgs, DcpEngine, DcpError, EngineConfig, HostApi, HostSessionInfo, Message, Part,
    PermissionReply, Role, ToolPart, ToolState,
};
use serde_json::json;
use tempfile::TempDir;

struct StubHost {
    sub_agent: bool,
}

#[async_trait]
impl HostApi for StubHost {
    async fn session_get(&self, id: &str) -> Result<HostSessionInfo, DcpError> {
        Ok(HostSessionInfo {
            session_id: id.to_string(),
            is_sub_agent: self.sub_agent,
        })
    }

    async fn session_messages(&self, _id: &str) -> Result<Vec<Message>, DcpError> {
        Ok(Vec::new())
    }

    async fn session_abort(&self, _id: &str) -> Result<(), DcpError> {
        Ok(())
    }

    async fn permission_reply(&self, _request_id: &str, _reply: PermissionReply) -> Result<(), DcpError> {
        Ok(())
    }
}

fn user_message(id: &str, session: &str, offset_secs: i64) -> Message {
    Message {
        id: id.into(),
        session_id: session.into(),
        role: Role::User,
        created: Utc::now() + chrono::Duration::seconds(offset_secs),
        summary: false,
        ignored: false,
        parts: vec![Part::Text {
            text: "hi".into(),
            synthetic: false,
        }],
    }
}

fn assistant_tool_message(
    id: &str,
    session: &str,
    offset_secs: i64,
    call_id: &str,
    tool: &str,
    output: &str,
) -> Message {
    Message {
        id: id.into(),
        session_id: session.into(),
        role: Role::Assistant,
        created: Utc::now() + chrono::Duration::seconds(offset_secs),
        summary: false,
        ignored: false,
        parts: vec![
            Part::StepStart,
            Part::Tool(ToolPart {
                call_id: call_id.into(),
                tool: tool.into(),
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

fn engine_with_tempdir(sub_agent: bool) -> (DcpEngine, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        storage_root: Some(dir.path().to_path_buf()),
        ..EngineConfig::default()
    };
    let engine = DcpEngine::new(Arc::new(StubHost { sub_agent }), config);
    (engine, dir)
}

/// S1 — first-run prune after two turns, driven end to end: rewrite once to
/// establish refs, record the tool calls, then run the manual prune tool and
/// check the persisted file.
#[tokio::test]
async fn s1_prune_after_two_turns_persists_to_disk() {
    let (engine, dir) = engine_with_tempdir(false);

    let m1 = user_message("m1", "s-1", 0);
    let m2 = assistant_tool_message("m2", "s-1", 1, "c1", "bash", "hello\nworld");
    let m3 = user_message("m3", "s-1", 2);
    let m4 = assistant_tool_message("m4", "s-1", 3, "c2", "grep", "matched lines");

    // Events stream in turn by turn, the way the host actually delivers
    // them — `checkSession` (driven here by `rewrite_prompt`) must run
    // against the transcript as it stood *before* a tool call lands, so
    // each call's recorded `turn` matches spec.md's S1 walkthrough: c1 at
    // turn 0, c2 at turn 1.
    engine.rewrite_prompt(&[m1.clone()]).await;
    engine
        .on_event(
            dcp_engine::HostEvent::MessagePartUpdated {
                session_id: "s-1".into(),
                message_id: "m2".into(),
                role: Role::Assistant,
                tool: Some(dcp_engine::router::tool_event_from_state(
                    "c1",
                    "bash",
                    &ToolState::Completed {
                        input: json!({"cmd": "echo hi"}),
                        output: "hello\nworld".into(),
                        title: None,
                        time: Utc::now(),
                        attachments: vec![],
                    },
                )),
            },
            &[m1.clone()],
        )
        .await;

    engine.rewrite_prompt(&[m1.clone(), m2.clone(), m3.clone()]).await;
    engine
        .on_event(
            dcp_engine::HostEvent::MessagePartUpdated {
                session_id: "s-1".into(),
                message_id: "m4".into(),
                role: Role::Assistant,
                tool: Some(dcp_engine::router::tool_event_from_state(
                    "c2",
                    "grep",
                    &ToolState::Completed {
                        input: json!({}),
                        output: "matched lines".into(),
                        title: None,
                        time: Utc::now(),
                        attachments: vec![],
                    },
                )),
            },
            &[m1.clone(), m2.clone(), m3.clone()],
        )
        .await;

    let messages = vec![m1, m2, m3, m4];
    // checkSession recounts turns against the full transcript.
    engine.rewrite_prompt(&messages).await;

    let outcome = engine.run_prune("s-1", &messages, "prune").await;
    assert_eq!(outcome.pruned_tool_ids, vec!["c1".to_string()]);
    assert!(outcome.tokens_saved > 0);

    // Persistence is fire-and-forget (spawned); give it a moment to land.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let path = dir.path().join("s-1.json");
    assert!(path.exists(), "expected a persisted session file at {path:?}");
    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(contents.contains("\"c1\""));
    assert!(!contents.contains("\"c2\""));
}

/// Sub-agent sessions never prune, even via the manual tool.
#[tokio::test]
async fn sub_agent_session_is_never_pruned() {
    let (engine, _dir) = engine_with_tempdir(true);
    let messages = vec![
        user_message("m1", "sub-1", 0),
        assistant_tool_message("m2", "sub-1", 1, "c1", "bash", "output"),
    ];
    engine.rewrite_prompt(&messages).await;
    engine
        .on_event(
            dcp_engine::HostEvent::MessagePartUpdated {
                session_id: "sub-1".into(),
                message_id: "m2".into(),
                role: Role::Assistant,
                tool: Some(dcp_engine::router::tool_event_from_state(
                    "c1",
                    "bash",
                    &ToolState::Completed {
                        input: json!({}),
                        output: "output".into(),
                        title: None,
                        time: Utc::now(),
                        attachments: vec![],
                    },
                )),
            },
            &messages,
        )
        .await;
    engine.rewrite_prompt(&messages).await;

    // A tool-parameter entry exists (it's still recorded), but the planner
    // refuses to touch any session flagged as a sub-agent.
    let outcome = engine.run_prune("sub-1", &messages, "prune").await;
    assert!(outcome.pruned_tool_ids.is_empty());
}

/// S3 — an invalid compress boundary is rejected and leaves state
/// untouched, reported through the public `run_compress` entry point.
#[tokio::test]
async fn s3_invalid_boundary_through_public_api() {
    let (engine, _dir) = engine_with_tempdir(false);
    let messages = vec![user_message("m1", "s-3", 0)];
    engine.rewrite_prompt(&messages).await;

    let err = engine
        .run_compress(
            "s-3",
            &messages,
            CompressArgs {
                topic: "setup".into(),
                start_id: "m9999".into(),
                end_id: "m0001".into(),
                summary: "text".into(),
            },
        )
        .await
        .unwrap_err();

    match err {
        DcpError::Validation(issues) => {
            assert!(issues.iter().any(|i| i.contains("m9999")));
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
}

/// Compress through the public API allocates a block and the next rewrite
/// reflects it.
#[tokio::test]
async fn compress_then_rewrite_shows_block() {
    let (engine, _dir) = engine_with_tempdir(false);
    let messages = vec![user_message("m1", "s-4", 0), user_message("m2", "s-4", 1)];
    engine.rewrite_prompt(&messages).await;

    let outcome = engine
        .run_compress(
            "s-4",
            &messages,
            CompressArgs {
                topic: "setup".into(),
                start_id: "m0001".into(),
                end_id: "m0002".into(),
                summary: "Covered the initial setup.".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.block_id, 1);
    assert_eq!(outcome.pruned_count, 2);

    // Only the anchor message (m1) becomes the block; m2 is still present
    // in the outbound list but as a pruned-whole placeholder (it was added
    // to `prune.messages` by the compress range, per spec.md §4.7 step 10).
    let out = engine.rewrite_prompt(&messages).await;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].ref_id, "b1");
    assert!(out[0].render().contains("Covered the initial setup."));
    assert!(out[1].render().contains("pruned message"));
}

/// Running `rewrite_prompt` twice with no intervening events is idempotent
/// (invariant #7 in spec.md §8), exercised through the public API.
#[tokio::test]
async fn rewrite_prompt_idempotent_through_public_api() {
    let (engine, _dir) = engine_with_tempdir(false);
    let messages = vec![user_message("m1", "s-5", 0), user_message("m2", "s-5", 1)];

    let first = engine.rewrite_prompt(&messages).await;
    let second = engine.rewrite_prompt(&messages).await;
    assert_eq!(first, second);
}

/// `statsAllSessions` aggregates across whatever got persisted above.
#[tokio::test]
async fn stats_all_sessions_reflects_persisted_files() {
    let (engine, dir) = engine_with_tempdir(false);
    let m1 = user_message("m1", "s-6", 0);
    let m2 = assistant_tool_message("m2", "s-6", 1, "c1", "bash", "output");

    // Tool call lands at turn 0, before `m2`'s own step-start is counted.
    engine.rewrite_prompt(&[m1.clone()]).await;
    engine
        .on_event(
            dcp_engine::HostEvent::MessagePartUpdated {
                session_id: "s-6".into(),
                message_id: "m2".into(),
                role: Role::Assistant,
                tool: Some(dcp_engine::router::tool_event_from_state(
                    "c1",
                    "bash",
                    &ToolState::Completed {
                        input: json!({}),
                        output: "output".into(),
                        title: None,
                        time: Utc::now(),
                        attachments: vec![],
                    },
                )),
            },
            &[m1.clone()],
        )
        .await;

    let messages = vec![m1, m2];
    engine.rewrite_prompt(&messages).await;
    engine.run_prune("s-6", &messages, "prune").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let stats = engine.stats_all_sessions().await;
    assert_eq!(stats.session_count, 1);
    assert!(stats.total_tokens > 0);
    let _ = dir; // keep tempdir alive for the duration of the test
}
