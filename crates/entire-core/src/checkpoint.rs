//! Checkpoint data model.
//!
//! A checkpoint is the immutable record of one agent turn. On the metadata
//! branch it is a directory named by its sharded checkpoint ID, holding an
//! aggregated root `metadata.json` plus one numbered subdirectory per
//! participating session (index 0 is the primary).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which persistence policy produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    ManualCommit,
    AutoCommit,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::ManualCommit => "manual-commit",
            StrategyKind::AutoCommit => "auto-commit",
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual-commit" => Ok(StrategyKind::ManualCommit),
            "auto-commit" => Ok(StrategyKind::AutoCommit),
            other => Err(format!("unknown strategy: '{other}'")),
        }
    }
}

/// Token accounting for a turn, summed across sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub api_call_count: u64,
}

impl TokenUsage {
    /// Element-wise accumulation.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.output_tokens += other.output_tokens;
        self.api_call_count += other.api_call_count;
    }

    pub fn is_zero(&self) -> bool {
        *self == TokenUsage::default()
    }
}

/// Absolute logical paths of one session entry's artifacts, rooted at the
/// metadata branch (they begin with `/`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntryPaths {
    pub metadata: String,
    pub transcript: String,
    pub context: String,
    pub content_hash: String,
    pub prompt: String,
}

impl SessionEntryPaths {
    /// Paths for session entry `index` of the checkpoint at `tree_path`
    /// (e.g. `a1/b2c3d4e5f6`).
    pub fn for_entry(tree_path: &str, index: usize) -> Self {
        let base = format!("/{tree_path}/{index}");
        SessionEntryPaths {
            metadata: format!("{base}/{}", crate::paths::METADATA_FILE),
            transcript: format!("{base}/{}", crate::paths::TRANSCRIPT_FILE),
            context: format!("{base}/{}", crate::paths::CONTEXT_FILE),
            content_hash: format!("{base}/{}", crate::paths::CONTENT_HASH_FILE),
            prompt: format!("{base}/{}", crate::paths::PROMPT_FILE),
        }
    }
}

/// Per-session metadata stored at `<checkpoint>/<index>/metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    /// Single agent tag (historical key name is plural).
    #[serde(default)]
    pub agents: String,
    #[serde(default)]
    pub files_touched: Vec<String>,
    /// Number of intra-turn saves collapsed into this entry (≥ 1).
    pub checkpoints_count: u64,
    #[serde(default)]
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated checkpoint record stored at `<checkpoint>/metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub strategy: StrategyKind,
    /// User branch the turn occurred on.
    pub branch: String,
    pub checkpoints_count: u64,
    pub files_touched: Vec<String>,
    pub sessions: Vec<SessionEntryPaths>,
    pub token_usage: TokenUsage,
    /// User commits this checkpoint has been attributed to. Absent until
    /// the first attribution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<String>,
}

impl CheckpointSummary {
    /// Rebuild the aggregate fields from the per-session metadata records,
    /// preserving identity fields (`checkpoint_id`, `strategy`, `branch`,
    /// `commits`).
    pub fn recompute(&mut self, tree_path: &str, sessions: &[SessionMetadata]) {
        let mut usage = TokenUsage::default();
        let mut files: Vec<String> = Vec::new();
        let mut count = 0;
        for meta in sessions {
            usage.add(&meta.token_usage);
            count += meta.checkpoints_count;
            for f in &meta.files_touched {
                if !files.contains(f) {
                    files.push(f.clone());
                }
            }
        }
        files.sort();

        self.token_usage = usage;
        self.files_touched = files;
        self.checkpoints_count = count;
        self.sessions = (0..sessions.len())
            .map(|i| SessionEntryPaths::for_entry(tree_path, i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(session_id: &str, files: &[&str], usage: TokenUsage) -> SessionMetadata {
        SessionMetadata {
            session_id: session_id.to_string(),
            agents: String::new(),
            files_touched: files.iter().map(|s| s.to_string()).collect(),
            checkpoints_count: 1,
            token_usage: usage,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            api_call_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_token_usage_add() {
        let mut a = usage(10, 20);
        a.add(&usage(1, 2));
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 22);
        assert_eq!(a.api_call_count, 2);
    }

    #[test]
    fn test_recompute_sums_and_unions() {
        let mut summary = CheckpointSummary {
            checkpoint_id: "a1b2c3d4e5f6".into(),
            strategy: StrategyKind::ManualCommit,
            branch: "main".into(),
            checkpoints_count: 0,
            files_touched: vec![],
            sessions: vec![],
            token_usage: TokenUsage::default(),
            commits: vec![],
        };

        let sessions = vec![
            meta("s1", &["a.txt", "b.txt"], usage(10, 5)),
            meta("s2", &["b.txt", "c.txt"], usage(3, 4)),
        ];
        summary.recompute("a1/b2c3d4e5f6", &sessions);

        assert_eq!(summary.token_usage.input_tokens, 13);
        assert_eq!(summary.token_usage.output_tokens, 9);
        assert_eq!(summary.token_usage.api_call_count, 2);
        assert_eq!(summary.files_touched, vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(summary.checkpoints_count, 2);
        assert_eq!(summary.sessions.len(), 2);
        assert_eq!(summary.sessions[0].metadata, "/a1/b2c3d4e5f6/0/metadata.json");
        assert_eq!(summary.sessions[1].transcript, "/a1/b2c3d4e5f6/1/full.jsonl");
    }

    #[test]
    fn test_summary_json_shape() {
        let summary = CheckpointSummary {
            checkpoint_id: "a1b2c3d4e5f6".into(),
            strategy: StrategyKind::ManualCommit,
            branch: "feature/x".into(),
            checkpoints_count: 1,
            files_touched: vec!["file.txt".into()],
            sessions: vec![SessionEntryPaths::for_entry("a1/b2c3d4e5f6", 0)],
            token_usage: TokenUsage::default(),
            commits: vec![],
        };

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["strategy"], "manual-commit");
        assert_eq!(value["token_usage"]["input_tokens"], 0);
        assert_eq!(value["token_usage"]["cache_creation_tokens"], 0);
        assert_eq!(value["token_usage"]["cache_read_tokens"], 0);
        assert_eq!(value["token_usage"]["output_tokens"], 0);
        assert_eq!(value["token_usage"]["api_call_count"], 0);
        assert_eq!(value["sessions"][0]["prompt"], "/a1/b2c3d4e5f6/0/prompt.txt");
        // A fresh checkpoint has no commits key at all.
        assert!(value.get("commits").is_none());
    }

    #[test]
    fn test_strategy_kind_round_trip() {
        let kind: StrategyKind = "auto-commit".parse().unwrap();
        assert_eq!(kind, StrategyKind::AutoCommit);
        assert_eq!(
            serde_json::to_string(&StrategyKind::ManualCommit).unwrap(),
            "\"manual-commit\""
        );
        assert!("squash-commit".parse::<StrategyKind>().is_err());
    }
}
