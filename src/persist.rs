//! C4 — atomic, crash-safe persistence of session state to disk.
//!
//! One JSON file per session, at
//! `$XDG_DATA_HOME/opencode/storage/plugin/dcp/{sessionId}.json` (spec.md
//! §4.4), named by session id. Writes go to a temp file in the same
//! directory and are renamed into place, so a reader never observes a
//! partially-written file (mirrors the teacher's
//! `FileSessionStorage::save_session`).
//!
//! The ID registry is deliberately not part of this schema: only
//! `sessionName`, `prune`, `compressSummaries`, `stats`, and
//! `lastCompaction` survive a restart, so message refs are reassigned
//! starting at `m0001` the first time a restarted process rewrites a
//! session's history.
//! Existing refs already sent to the model go stale at that point; this
//! mirrors the persisted field list this schema was modeled on and is
//! tracked as a known limitation rather than silently patched over.
//! `lastCompaction` itself must survive the restart even though the id
//! registry doesn't: without it, reloading a session after a process
//! restart would see `last_compaction == None` and re-fire the reset on
//! the next already-seen compaction message (spec.md §4.3/S4).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::EngineConfig;
use crate::error::DcpError;
use crate::session::{CompressSummary, PruneState, SessionState, Stats};

const DIR_NAME: &str = "opencode/storage/plugin/dcp";

/// Resolves to spec.md §4.4's fixed path,
/// `$XDG_DATA_HOME/opencode/storage/plugin/dcp`, unless the host overrides
/// it via `EngineConfig::storage_root` (embedding hosts that sandbox their
/// own data directory still need a way out of the XDG default).
pub fn resolve_storage_root(config: &EngineConfig) -> PathBuf {
    if let Some(root) = &config.storage_root {
        return root.clone();
    }
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(DIR_NAME)
}

fn session_file(root: &Path, session_id: &str) -> PathBuf {
    root.join(format!("{session_id}.json"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPrune {
    #[serde(default)]
    pub tools: HashMap<String, u64>,
    #[serde(default)]
    pub messages: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSummary {
    pub block_id: u32,
    pub anchor_message_id: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStats {
    #[serde(default)]
    pub prune_token_counter: u64,
    #[serde(default)]
    pub total_prune_tokens: u64,
}

/// The on-disk shape — field names are camelCase on the wire (spec.md §6)
/// even though the in-memory Rust fields stay snake_case. `session_name`
/// and `last_updated` round-trip even though the engine itself never reads
/// them back into a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub session_name: Option<String>,
    pub prune: PersistedPrune,
    pub compress_summaries: Vec<PersistedSummary>,
    pub stats: PersistedStats,
    /// Timestamp of the newest compaction message this session has reset
    /// against. Persisted so a process restart doesn't re-observe the same
    /// compaction as "new" and fire a spurious second reset.
    #[serde(default)]
    pub last_compaction: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

pub fn to_persisted(state: &SessionState) -> PersistedSession {
    PersistedSession {
        session_name: state.session_name.clone(),
        prune: PersistedPrune {
            tools: state.prune.tools.clone(),
            messages: state.prune.messages.clone(),
        },
        compress_summaries: state
            .compress_summaries
            .iter()
            .map(|s| PersistedSummary {
                block_id: s.block_id,
                anchor_message_id: s.anchor_message_id.clone(),
                summary: s.summary.clone(),
            })
            .collect(),
        stats: PersistedStats {
            prune_token_counter: state.stats.prune_token_counter,
            total_prune_tokens: state.stats.total_prune_tokens,
        },
        last_compaction: state.last_compaction,
        last_updated: Utc::now(),
    }
}

/// Merges a loaded snapshot into a freshly-constructed `SessionState`.
/// Never called on a state that already has live data — loading only
/// happens once, right after a session handle is created.
pub fn apply_persisted(state: &mut SessionState, persisted: PersistedSession) {
    state.session_name = persisted.session_name;
    state.prune = PruneState {
        tools: persisted.prune.tools,
        messages: persisted.prune.messages,
    };
    state.compress_summaries = persisted
        .compress_summaries
        .into_iter()
        .map(|s| CompressSummary {
            block_id: s.block_id,
            anchor_message_id: s.anchor_message_id,
            summary: s.summary,
        })
        .collect();
    state.stats = Stats {
        prune_token_counter: persisted.stats.prune_token_counter,
        total_prune_tokens: persisted.stats.total_prune_tokens,
    };
    state.last_compaction = persisted.last_compaction;
}

fn ids_from_value_array(value: Option<&Value>) -> HashMap<String, u64> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(|id| (id.to_string(), 0u64))
                .collect()
        })
        .unwrap_or_default()
}

fn migrate_prune(raw: &Value) -> PersistedPrune {
    // Legacy shape: `prune.toolIds: string[]`, `prune.messageIds: string[]`.
    if raw.get("toolIds").is_some() || raw.get("messageIds").is_some() {
        return PersistedPrune {
            tools: ids_from_value_array(raw.get("toolIds")),
            messages: ids_from_value_array(raw.get("messageIds")),
        };
    }
    serde_json::from_value(raw.clone()).unwrap_or_default()
}

/// Drops entries not shaped as `{blockId:int, anchorMessageId:string,
/// summary:string}`, assigns a fresh block id when missing, and
/// de-duplicates by `blockId` with first-wins semantics.
fn migrate_summaries(raw: &[Value]) -> Vec<PersistedSummary> {
    let mut next_block_id = raw
        .iter()
        .filter_map(|v| v.get("blockId").and_then(Value::as_u64))
        .max()
        .map_or(1, |m| m as u32 + 1);

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for entry in raw {
        let Some(anchor_message_id) = entry.get("anchorMessageId").and_then(Value::as_str) else {
            continue;
        };
        let Some(summary) = entry.get("summary").and_then(Value::as_str) else {
            continue;
        };
        let block_id = match entry.get("blockId").and_then(Value::as_u64) {
            Some(id) => id as u32,
            None => {
                let id = next_block_id;
                next_block_id += 1;
                id
            }
        };
        if !seen.insert(block_id) {
            continue;
        }
        out.push(PersistedSummary {
            block_id,
            anchor_message_id: anchor_message_id.to_string(),
            summary: summary.to_string(),
        });
    }
    out
}

/// Loads a session file. Returns `Ok(None)` both when the file is absent
/// and when it parses but is missing the required `prune`/`stats` fields
/// (treated as "no persisted state", not an error) — a partially written
/// file from a crash between create and rename looks the same as a
/// missing one from here.
pub async fn load(root: &Path, session_id: &str) -> Result<Option<PersistedSession>, DcpError> {
    let path = session_file(root, session_id);
    let bytes = match fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DcpError::Persist(format!("reading {}: {e}", path.display()))),
    };

    let raw: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    if raw.get("prune").is_none() || raw.get("stats").is_none() {
        return Ok(None);
    }

    let prune = migrate_prune(raw.get("prune").unwrap());
    let summaries = raw
        .get("compressSummaries")
        .and_then(Value::as_array)
        .map(|arr| migrate_summaries(arr))
        .unwrap_or_default();
    let stats: PersistedStats = serde_json::from_value(raw["stats"].clone()).unwrap_or_default();
    let session_name = raw
        .get("sessionName")
        .and_then(Value::as_str)
        .map(str::to_string);
    let last_updated = raw
        .get("lastUpdated")
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
        .unwrap_or_else(Utc::now);
    let last_compaction = raw
        .get("lastCompaction")
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());

    Ok(Some(PersistedSession {
        session_name,
        prune,
        compress_summaries: summaries,
        stats,
        last_compaction,
        last_updated,
    }))
}

pub async fn save(root: &Path, session_id: &str, data: &PersistedSession) -> Result<(), DcpError> {
    fs::create_dir_all(root)
        .await
        .map_err(|e| DcpError::Persist(format!("creating {}: {e}", root.display())))?;

    let target = session_file(root, session_id);
    let temp = target.with_extension("json.tmp");

    let body = serde_json::to_vec_pretty(data)
        .map_err(|e| DcpError::Persist(format!("serializing session state: {e}")))?;

    let mut file = fs::File::create(&temp)
        .await
        .map_err(|e| DcpError::Persist(format!("creating {}: {e}", temp.display())))?;
    file.write_all(&body)
        .await
        .map_err(|e| DcpError::Persist(format!("writing {}: {e}", temp.display())))?;
    file.flush()
        .await
        .map_err(|e| DcpError::Persist(format!("flushing {}: {e}", temp.display())))?;
    file.sync_all()
        .await
        .map_err(|e| DcpError::Persist(format!("syncing {}: {e}", temp.display())))?;
    drop(file);

    fs::rename(&temp, &target).await.map_err(|e| {
        DcpError::Persist(format!(
            "renaming {} to {}: {e}",
            temp.display(),
            target.display()
        ))
    })?;

    Ok(())
}

/// Totals for the reporting surface: sessions on disk, distinct tools and
/// messages ever pruned across them, and the cumulative token credit.
/// Malformed files are skipped silently, matching the read-path tolerance.
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateStats {
    pub session_count: usize,
    pub tool_count: usize,
    pub message_count: usize,
    pub total_prune_tokens: u64,
}

pub async fn aggregate_stats(root: &Path) -> Result<AggregateStats, DcpError> {
    let mut totals = AggregateStats::default();
    let mut entries = match fs::read_dir(root).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(totals),
        Err(e) => return Err(DcpError::Persist(format!("reading {}: {e}", root.display()))),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DcpError::Persist(format!("iterating {}: {e}", root.display())))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(bytes) = fs::read(&path).await else {
            continue;
        };
        let Ok(persisted) = serde_json::from_slice::<PersistedSession>(&bytes) else {
            tracing::warn!(path = %path.display(), "skipping malformed session file during stats aggregation");
            continue;
        };
        totals.session_count += 1;
        totals.tool_count += persisted.prune.tools.len();
        totals.message_count += persisted.prune.messages.len();
        totals.total_prune_tokens += persisted.stats.total_prune_tokens;
    }

    Ok(totals)
}
