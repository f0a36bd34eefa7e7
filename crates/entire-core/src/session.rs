//! Per-session runtime state and its durable store.
//!
//! Each session gets one JSON file at `<metadata-dir>/<session-id>.json`.
//! Writes are atomic (temp + fsync + rename); reads tolerate leftover
//! `.tmp` files by ignoring them; enumeration skips files that fail to
//! parse (reported, not fatal). Unknown keys survive read-modify-write.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{EntireError, EntireResult};
use crate::fsutil::{atomic_write, read_json_if_exists, remove_if_exists};

/// Upper bound on remembered event IDs per session.
const APPLIED_EVENTS_CAP: usize = 64;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Between prompt-submit and stop for the current turn.
    Active,
    /// Initial, and after every turn completion.
    Idle,
    /// Terminal.
    Ended,
}

/// A nested turn frame opened by a pre-task event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFrame {
    pub task_id: String,
    pub checkpoint_id: String,
    /// Files already pending when the frame opened; the frame owns the
    /// difference at post-task time.
    #[serde(default)]
    pub files_at_start: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
}

/// Snapshot of a finished turn, kept until attribution consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub checkpoint_id: String,
    pub ended_at: DateTime<Utc>,
    /// Per-path blob IDs of the files the turn wrote, captured at turn end.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Paths already matched to a commit; the rest are carry-forward.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub consumed: BTreeSet<String>,
    /// Tree ID of the worktree snapshot at turn end (manual-commit only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_tree: Option<String>,
}

impl TurnRecord {
    /// Files the turn produced that no commit has claimed yet.
    pub fn carried_forward(&self) -> impl Iterator<Item = &String> {
        self.files.keys().filter(move |p| !self.consumed.contains(*p))
    }

    pub fn fully_consumed(&self) -> bool {
        self.files.keys().all(|p| self.consumed.contains(p))
    }
}

/// Durable runtime state for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    /// Commit the session started from.
    pub base_commit: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_turn_checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turn_checkpoint_ids: Vec<String>,
    #[serde(default)]
    pub pending_files: BTreeSet<String>,
    pub worktree_id: String,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,

    /// Prompts submitted during the open turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turn_prompts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_frames: Vec<TaskFrame>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turn_records: Vec<TurnRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_events: Vec<String>,
    /// Monotonic sequence fed into checkpoint ID minting.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub checkpoint_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,

    /// Keys beyond the known set, preserved on read-modify-write.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl SessionState {
    pub fn new(session_id: &str, base_commit: &str, worktree_id: &str) -> Self {
        let now = Utc::now();
        SessionState {
            session_id: session_id.to_string(),
            base_commit: base_commit.to_string(),
            phase: Phase::Idle,
            current_turn_checkpoint_id: None,
            turn_checkpoint_ids: Vec::new(),
            pending_files: BTreeSet::new(),
            worktree_id: worktree_id.to_string(),
            started_at: now,
            last_event_at: now,
            turn_prompts: Vec::new(),
            task_frames: Vec::new(),
            turn_records: Vec::new(),
            applied_events: Vec::new(),
            checkpoint_seq: 0,
            transcript_path: None,
            extra: BTreeMap::new(),
        }
    }

    /// Record an event ID as applied. Returns `false` if it was already
    /// applied (the re-delivery must be discarded).
    pub fn mark_event_applied(&mut self, event_id: &str) -> bool {
        if self.applied_events.iter().any(|e| e == event_id) {
            return false;
        }
        self.applied_events.push(event_id.to_string());
        if self.applied_events.len() > APPLIED_EVENTS_CAP {
            let excess = self.applied_events.len() - APPLIED_EVENTS_CAP;
            self.applied_events.drain(..excess);
        }
        true
    }

    /// Next checkpoint mint sequence.
    pub fn next_seq(&mut self) -> u64 {
        self.checkpoint_seq += 1;
        self.checkpoint_seq
    }
}

/// Validate a session ID before it is used as a filename component.
pub fn validate_session_id(session_id: &str) -> EntireResult<()> {
    let ok = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !session_id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(EntireError::InvalidSessionId(session_id.to_string()))
    }
}

/// Store for session state files under the metadata directory.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(metadata_dir: &Path) -> Self {
        SessionStore {
            dir: metadata_dir.to_path_buf(),
        }
    }

    fn state_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Load a session state, or `None` if no file exists.
    pub fn load(&self, session_id: &str) -> EntireResult<Option<SessionState>> {
        validate_session_id(session_id)?;
        read_json_if_exists(&self.state_path(session_id))
    }

    /// Persist a session state atomically.
    pub fn save(&self, state: &SessionState) -> EntireResult<()> {
        validate_session_id(&state.session_id)?;
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&self.state_path(&state.session_id), json.as_bytes())
    }

    pub fn delete(&self, session_id: &str) -> EntireResult<()> {
        validate_session_id(session_id)?;
        remove_if_exists(&self.state_path(session_id))
    }

    /// All sessions whose `base_commit` equals the given commit.
    pub fn find_by_base_commit(&self, commit: &str) -> EntireResult<Vec<SessionState>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|s| s.base_commit == commit)
            .collect())
    }

    /// Enumerate every parseable session state. Files that fail to parse
    /// are reported and skipped; `.tmp` and `.lock` files are ignored.
    pub fn list_all(&self) -> EntireResult<Vec<SessionState>> {
        let mut states = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(states),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(data) => match serde_json::from_str::<SessionState>(&data) {
                    Ok(state) => states.push(state),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unparseable session state"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session state"),
            }
        }

        states.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let mut state = SessionState::new("s1", "abc123", "00112233");
        state.phase = Phase::Active;
        state.current_turn_checkpoint_id = Some("a1b2c3d4e5f6".into());
        state.pending_files.insert("file.txt".into());
        store.save(&state).unwrap();

        let loaded = store.load("s1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.base_commit, "abc123");
        assert_eq!(loaded.phase, Phase::Active);
        assert_eq!(loaded.current_turn_checkpoint_id.as_deref(), Some("a1b2c3d4e5f6"));
        assert!(loaded.pending_files.contains("file.txt"));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load("absent").unwrap().is_none());
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let state = SessionState::new("s1", "abc", "00112233");
        store.save(&state).unwrap();

        // A future version (or another tool) adds a key we don't know.
        let path = dir.path().join("s1.json");
        let mut value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["future_field"] = Value::from("kept");
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let mut loaded = store.load("s1").unwrap().unwrap();
        loaded.phase = Phase::Ended;
        store.save(&loaded).unwrap();

        let reread: Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reread["future_field"], "kept");
        assert_eq!(reread["phase"], "ENDED");
    }

    #[test]
    fn test_phase_serializes_uppercase() {
        let state = SessionState::new("s1", "abc", "00112233");
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["phase"], "IDLE");
        // Empty turn list is omitted entirely.
        assert!(value.get("turn_checkpoint_ids").is_none());
    }

    #[test]
    fn test_list_all_skips_corrupt_and_tmp() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.save(&SessionState::new("good", "abc", "00112233")).unwrap();
        fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        fs::write(dir.path().join("partial.tmp"), "{\"session_id\"").unwrap();
        fs::write(dir.path().join("held.lock"), "").unwrap();

        let states = store.list_all().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].session_id, "good");
    }

    #[test]
    fn test_find_by_base_commit() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.save(&SessionState::new("s1", "aaa", "00112233")).unwrap();
        store.save(&SessionState::new("s2", "aaa", "00112233")).unwrap();
        store.save(&SessionState::new("s3", "bbb", "00112233")).unwrap();

        let found = store.find_by_base_commit("aaa").unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s.base_commit == "aaa"));
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(&SessionState::new("s1", "abc", "00112233")).unwrap();
        store.delete("s1").unwrap();
        assert!(store.load("s1").unwrap().is_none());
        // Deleting again is fine.
        store.delete("s1").unwrap();
    }

    #[test]
    fn test_invalid_session_ids_rejected() {
        assert!(validate_session_id("ok-id_1.2").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../escape").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id(".hidden").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_event_idempotency() {
        let mut state = SessionState::new("s1", "abc", "00112233");
        assert!(state.mark_event_applied("e1"));
        assert!(!state.mark_event_applied("e1"));
        assert!(state.mark_event_applied("e2"));
    }

    #[test]
    fn test_applied_events_bounded() {
        let mut state = SessionState::new("s1", "abc", "00112233");
        for i in 0..200 {
            state.mark_event_applied(&format!("e{i}"));
        }
        assert!(state.applied_events.len() <= APPLIED_EVENTS_CAP);
        // Oldest entries were evicted, newest kept.
        assert!(state.applied_events.iter().any(|e| e == "e199"));
        assert!(!state.applied_events.iter().any(|e| e == "e0"));
    }

    #[test]
    fn test_next_seq_monotonic() {
        let mut state = SessionState::new("s1", "abc", "00112233");
        assert_eq!(state.next_seq(), 1);
        assert_eq!(state.next_seq(), 2);
    }
}
