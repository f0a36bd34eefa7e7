//! Checkpoint artifact store on the metadata branch.
//!
//! Owns `entire/checkpoints/v1`, a branch that never intersects any
//! working tree: every write constructs blobs and trees directly and
//! advances the ref with a compare-and-swap, under the metadata-ref lock.
//! Layout on the branch, relative to its root:
//!
//! ```text
//! <XX>/<YYYYYYYYYY>/       XX = first byte of the checkpoint ID
//!   metadata.json          aggregated CheckpointSummary
//!   0/                     primary SessionEntry
//!     metadata.json
//!     prompt.txt
//!     full.jsonl
//!     context.md
//!     content_hash.txt
//!   1/ 2/ ...              additional sessions, numbered by join order
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use git2::{Oid, Repository, Signature};
use tracing::warn;

use crate::checkpoint::{CheckpointSummary, SessionMetadata, StrategyKind, TokenUsage};
use crate::error::{EntireError, EntireResult};
use crate::gittree::{build_tree, flatten_tree, TreeEntry};
use crate::id::{content_hash, CheckpointId};
use crate::lock::ScopedLock;
use crate::paths::{
    RepoPaths, CONTENT_HASH_FILE, CONTEXT_FILE, METADATA_FILE, METADATA_REF, PROMPT_FILE,
    TRANSCRIPT_FILE,
};

/// Separator between prompts in `prompt.txt`.
const PROMPT_SEPARATOR: &str = "\n\n---\n\n";

/// Join a turn's prompts into the `prompt.txt` representation.
/// An empty list serializes as zero bytes.
pub fn join_prompts(prompts: &[String]) -> String {
    prompts.join(PROMPT_SEPARATOR)
}

/// Inputs for creating a checkpoint tree.
pub struct WriteCommittedOptions<'a> {
    pub session_id: &'a str,
    pub strategy: StrategyKind,
    /// User branch the turn occurred on.
    pub branch: &'a str,
    /// Agent tag for the primary session entry.
    pub agent: &'a str,
    pub transcript: &'a [u8],
    pub prompts: &'a [String],
    pub context: &'a [u8],
    pub files_touched: &'a [String],
    pub token_usage: TokenUsage,
    /// Commit author; defaults to the repository signature.
    pub author: Option<(&'a str, &'a str)>,
}

/// Inputs for updating a checkpoint in place. Replace semantics: fields
/// left `None` are preserved byte-for-byte.
#[derive(Default)]
pub struct UpdateCommittedOptions<'a> {
    pub session_id: &'a str,
    pub transcript: Option<&'a [u8]>,
    pub prompts: Option<&'a [String]>,
    pub context: Option<&'a [u8]>,
    pub token_usage: Option<TokenUsage>,
    pub files_touched: Option<&'a [String]>,
    /// Stamp the session entry with an agent tag (post-task).
    pub agent: Option<&'a str>,
}

/// Inputs for appending a second (or later) session to a checkpoint.
pub struct AppendSessionOptions<'a> {
    pub session_id: &'a str,
    pub agent: &'a str,
    pub transcript: &'a [u8],
    pub prompts: &'a [String],
    pub context: &'a [u8],
    pub files_touched: &'a [String],
    pub token_usage: TokenUsage,
}

/// One session entry's content, read back from the branch.
pub struct SessionContent {
    pub metadata: SessionMetadata,
    pub transcript: Vec<u8>,
    pub prompts: String,
    pub context: String,
    pub content_hash: String,
}

/// Store over the metadata branch of one repository.
pub struct MetadataStore<'r> {
    repo: &'r Repository,
    metadata_dir: PathBuf,
}

impl<'r> MetadataStore<'r> {
    pub fn new(repo: &'r Repository, paths: &RepoPaths) -> Self {
        MetadataStore {
            repo,
            metadata_dir: paths.metadata_dir.clone(),
        }
    }

    // -------------------------------------------------------------------
    // Ref plumbing
    // -------------------------------------------------------------------

    fn signature(&self, author: Option<(&str, &str)>) -> EntireResult<Signature<'static>> {
        if let Some((name, email)) = author {
            return Ok(Signature::now(name, email)?);
        }
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(Signature::now("entire", "entire@localhost")?),
        }
    }

    /// Current tip of the metadata branch, if the branch exists.
    fn tip(&self) -> EntireResult<Option<Oid>> {
        match self.repo.find_reference(METADATA_REF) {
            Ok(r) => Ok(r.target()),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Flatten the branch tip into `path -> blob` entries.
    fn tip_entries(&self) -> EntireResult<BTreeMap<String, TreeEntry>> {
        let mut entries = BTreeMap::new();
        if let Some(tip) = self.tip()? {
            let commit = self.repo.find_commit(tip)?;
            let tree = commit.tree()?;
            flatten_tree(self.repo, &tree, "", &mut entries)?;
        }
        Ok(entries)
    }

    /// Run a mutation over the branch contents under the metadata-ref lock:
    /// read ref, flatten, apply `f`, build the new tree, commit, and advance
    /// the ref with a compare-and-swap against the tip we read.
    fn mutate<F>(&self, message: &str, author: Option<(&str, &str)>, f: F) -> EntireResult<()>
    where
        F: FnOnce(&Self, &mut BTreeMap<String, TreeEntry>) -> EntireResult<()>,
    {
        let _lock = ScopedLock::metadata_ref(&self.metadata_dir)?;

        let old_tip = self.tip()?;
        let mut entries = self.tip_entries()?;
        f(self, &mut entries)?;

        let tree_oid = build_tree(self.repo, &entries)?;
        if let Some(old) = old_tip {
            let old_commit = self.repo.find_commit(old)?;
            if old_commit.tree_id() == tree_oid {
                return Ok(()); // nothing changed
            }
        }

        let sig = self.signature(author)?;
        let tree = self.repo.find_tree(tree_oid)?;
        let new_commit = match old_tip {
            Some(old) => {
                let parent = self.repo.find_commit(old)?;
                self.repo
                    .commit(None, &sig, &sig, message, &tree, &[&parent])?
            }
            None => self.repo.commit(None, &sig, &sig, message, &tree, &[])?,
        };

        match old_tip {
            Some(old) => {
                self.repo
                    .reference_matching(METADATA_REF, new_commit, true, old, message)?;
            }
            None => {
                self.repo.reference(METADATA_REF, new_commit, false, message)?;
            }
        }
        Ok(())
    }

    fn blob(&self, entries: &BTreeMap<String, TreeEntry>, path: &str) -> EntireResult<Vec<u8>> {
        let entry = entries
            .get(path)
            .ok_or_else(|| EntireError::NotFound(path.to_string()))?;
        let blob = self.repo.find_blob(entry.oid)?;
        Ok(blob.content().to_vec())
    }

    fn put(
        &self,
        entries: &mut BTreeMap<String, TreeEntry>,
        path: String,
        data: &[u8],
    ) -> EntireResult<()> {
        let oid = self.repo.blob(data)?;
        entries.insert(path, TreeEntry::file(oid));
        Ok(())
    }

    // -------------------------------------------------------------------
    // Layout helpers
    // -------------------------------------------------------------------

    /// Session entry indices present under a checkpoint prefix, ascending.
    fn session_indices(entries: &BTreeMap<String, TreeEntry>, prefix: &str) -> Vec<usize> {
        let mut indices: Vec<usize> = entries
            .keys()
            .filter_map(|k| k.strip_prefix(&format!("{prefix}/")))
            .filter_map(|rest| rest.split_once('/'))
            .filter_map(|(dir, _)| dir.parse::<usize>().ok())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    fn checkpoint_exists(entries: &BTreeMap<String, TreeEntry>, prefix: &str) -> bool {
        entries.contains_key(&format!("{prefix}/{METADATA_FILE}"))
            || entries.keys().any(|k| k.starts_with(&format!("{prefix}/")))
    }

    /// A checkpoint is in the legacy layout when its session artifacts sit
    /// at the checkpoint root instead of a numbered subdirectory.
    fn is_legacy(entries: &BTreeMap<String, TreeEntry>, prefix: &str) -> bool {
        entries.contains_key(&format!("{prefix}/{PROMPT_FILE}"))
    }

    fn write_session_entry(
        &self,
        entries: &mut BTreeMap<String, TreeEntry>,
        prefix: &str,
        index: usize,
        metadata: &SessionMetadata,
        transcript: &[u8],
        prompts: &str,
        context: &[u8],
    ) -> EntireResult<()> {
        let base = format!("{prefix}/{index}");
        let hash = content_hash(
            transcript,
            prompts.as_bytes(),
            context,
            &metadata.files_touched,
        );
        self.put(
            entries,
            format!("{base}/{METADATA_FILE}"),
            serde_json::to_string_pretty(metadata)?.as_bytes(),
        )?;
        self.put(entries, format!("{base}/{TRANSCRIPT_FILE}"), transcript)?;
        self.put(entries, format!("{base}/{PROMPT_FILE}"), prompts.as_bytes())?;
        self.put(entries, format!("{base}/{CONTEXT_FILE}"), context)?;
        self.put(entries, format!("{base}/{CONTENT_HASH_FILE}"), hash.as_bytes())?;
        Ok(())
    }

    fn read_session_metadata(
        &self,
        entries: &BTreeMap<String, TreeEntry>,
        prefix: &str,
        index: usize,
    ) -> EntireResult<SessionMetadata> {
        let raw = self.blob(entries, &format!("{prefix}/{index}/{METADATA_FILE}"))?;
        serde_json::from_slice(&raw).map_err(|e| {
            EntireError::Corruption(format!("{prefix}/{index}/{METADATA_FILE}: {e}"))
        })
    }

    /// Rebuild the aggregated root `metadata.json` from all numbered
    /// subdirectories, preserving the summary's identity fields.
    fn rebuild_summary(
        &self,
        entries: &mut BTreeMap<String, TreeEntry>,
        prefix: &str,
        mut summary: CheckpointSummary,
    ) -> EntireResult<()> {
        let mut sessions = Vec::new();
        for index in Self::session_indices(entries, prefix) {
            sessions.push(self.read_session_metadata(entries, prefix, index)?);
        }
        summary.recompute(prefix, &sessions);
        self.put(
            entries,
            format!("{prefix}/{METADATA_FILE}"),
            serde_json::to_string_pretty(&summary)?.as_bytes(),
        )
    }

    fn read_summary(
        &self,
        entries: &BTreeMap<String, TreeEntry>,
        prefix: &str,
    ) -> EntireResult<CheckpointSummary> {
        let raw = self.blob(entries, &format!("{prefix}/{METADATA_FILE}"))?;
        serde_json::from_slice(&raw)
            .map_err(|e| EntireError::Corruption(format!("{prefix}/{METADATA_FILE}: {e}")))
    }

    // -------------------------------------------------------------------
    // Lazy garbage collection
    // -------------------------------------------------------------------

    /// Drop incomplete provisional checkpoints in the same shard as the
    /// checkpoint about to be written. Incomplete means `content_hash.txt`
    /// is absent or does not match the stored artifacts. Runs only inside
    /// an already-pending write, never synchronously on its own.
    fn gc_shard(
        &self,
        entries: &mut BTreeMap<String, TreeEntry>,
        shard: &str,
        keep_prefix: &str,
    ) -> EntireResult<()> {
        let dirs: Vec<String> = entries
            .keys()
            .filter_map(|k| k.strip_prefix(&format!("{shard}/")))
            .filter_map(|rest| rest.split_once('/'))
            .map(|(dir, _)| format!("{shard}/{dir}"))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        for dir in dirs {
            if dir == keep_prefix {
                continue;
            }
            if self.verify_entry_hashes(entries, &dir).is_ok() {
                continue;
            }
            warn!(checkpoint = %dir, "dropping incomplete provisional checkpoint");
            entries.retain(|k, _| !k.starts_with(&format!("{dir}/")));
        }
        Ok(())
    }

    /// Verify every session entry's stored content hash under a prefix.
    fn verify_entry_hashes(
        &self,
        entries: &BTreeMap<String, TreeEntry>,
        prefix: &str,
    ) -> EntireResult<()> {
        if Self::is_legacy(entries, prefix) {
            // Legacy trees predate content hashes; migration re-hashes them.
            return Ok(());
        }
        let indices = Self::session_indices(entries, prefix);
        if indices.is_empty() {
            return Err(EntireError::Corruption(format!("{prefix}: no session entries")));
        }
        for index in indices {
            let base = format!("{prefix}/{index}");
            let stored = self.blob(entries, &format!("{base}/{CONTENT_HASH_FILE}"))?;
            let metadata = self.read_session_metadata(entries, prefix, index)?;
            let transcript = self.blob(entries, &format!("{base}/{TRANSCRIPT_FILE}"))?;
            let prompts = self.blob(entries, &format!("{base}/{PROMPT_FILE}"))?;
            let context = self.blob(entries, &format!("{base}/{CONTEXT_FILE}"))?;
            let expect = content_hash(&transcript, &prompts, &context, &metadata.files_touched);
            if stored != expect.as_bytes() {
                return Err(EntireError::Corruption(format!(
                    "{base}/{CONTENT_HASH_FILE}: hash mismatch"
                )));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------

    /// Create a checkpoint tree. Fails with `AlreadyExists` if the path is
    /// occupied.
    pub fn write_committed(
        &self,
        id: &CheckpointId,
        opts: WriteCommittedOptions<'_>,
    ) -> EntireResult<()> {
        let prefix = id.tree_path();
        let shard = prefix[..2].to_string();
        let now = Utc::now();

        let metadata = SessionMetadata {
            session_id: opts.session_id.to_string(),
            agents: opts.agent.to_string(),
            files_touched: opts.files_touched.to_vec(),
            checkpoints_count: 1,
            token_usage: opts.token_usage,
            created_at: now,
            updated_at: now,
        };
        let summary = CheckpointSummary {
            checkpoint_id: id.as_str().to_string(),
            strategy: opts.strategy,
            branch: opts.branch.to_string(),
            checkpoints_count: 0,
            files_touched: Vec::new(),
            sessions: Vec::new(),
            token_usage: TokenUsage::default(),
            commits: Vec::new(),
        };
        let prompts = join_prompts(opts.prompts);

        self.mutate(
            &format!("checkpoint {id}: create"),
            opts.author,
            |store, entries| {
                if Self::checkpoint_exists(entries, &prefix) {
                    return Err(EntireError::AlreadyExists(id.as_str().to_string()));
                }
                store.gc_shard(entries, &shard, &prefix)?;
                store.write_session_entry(
                    entries,
                    &prefix,
                    0,
                    &metadata,
                    opts.transcript,
                    &prompts,
                    opts.context,
                )?;
                store.rebuild_summary(entries, &prefix, summary)
            },
        )
    }

    /// Update a checkpoint in place. Locates the target session entry by
    /// `session_id`; if not found, falls back to index 0. Rewrites
    /// `content_hash.txt`; preserves untouched fields and the summary's
    /// identity.
    pub fn update_committed(
        &self,
        id: &CheckpointId,
        opts: UpdateCommittedOptions<'_>,
    ) -> EntireResult<()> {
        let prefix = id.tree_path();

        self.mutate(&format!("checkpoint {id}: update"), None, |store, entries| {
            if !Self::checkpoint_exists(entries, &prefix) {
                return Err(EntireError::NotFound(id.as_str().to_string()));
            }
            if Self::is_legacy(entries, &prefix) {
                store.migrate_legacy_entries(entries, &prefix)?;
            }

            let indices = Self::session_indices(entries, &prefix);
            let target = indices
                .iter()
                .copied()
                .find(|&i| {
                    store
                        .read_session_metadata(entries, &prefix, i)
                        .map(|m| m.session_id == opts.session_id)
                        .unwrap_or(false)
                })
                .or_else(|| indices.first().copied())
                .ok_or_else(|| {
                    EntireError::Corruption(format!("{prefix}: no session entries"))
                })?;

            let base = format!("{prefix}/{target}");
            let mut metadata = store.read_session_metadata(entries, &prefix, target)?;

            let transcript = match opts.transcript {
                Some(t) => t.to_vec(),
                None => store.blob(entries, &format!("{base}/{TRANSCRIPT_FILE}"))?,
            };
            let prompts = match opts.prompts {
                Some(p) => join_prompts(p),
                None => {
                    String::from_utf8_lossy(&store.blob(entries, &format!("{base}/{PROMPT_FILE}"))?)
                        .into_owned()
                }
            };
            let context = match opts.context {
                Some(c) => c.to_vec(),
                None => store.blob(entries, &format!("{base}/{CONTEXT_FILE}"))?,
            };

            if let Some(usage) = opts.token_usage {
                metadata.token_usage = usage;
            }
            if let Some(files) = opts.files_touched {
                metadata.files_touched = files.to_vec();
            }
            if let Some(agent) = opts.agent {
                metadata.agents = agent.to_string();
            }
            metadata.checkpoints_count += 1;
            metadata.updated_at = Utc::now();

            store.write_session_entry(
                entries,
                &prefix,
                target,
                &metadata,
                &transcript,
                &prompts,
                &context,
            )?;

            let summary = store.read_summary(entries, &prefix)?;
            store.rebuild_summary(entries, &prefix, summary)
        })
    }

    /// Append a new session entry as the next numbered subdirectory and
    /// recompute the root summary.
    pub fn append_session(
        &self,
        id: &CheckpointId,
        opts: AppendSessionOptions<'_>,
    ) -> EntireResult<()> {
        let prefix = id.tree_path();
        let now = Utc::now();
        let metadata = SessionMetadata {
            session_id: opts.session_id.to_string(),
            agents: opts.agent.to_string(),
            files_touched: opts.files_touched.to_vec(),
            checkpoints_count: 1,
            token_usage: opts.token_usage,
            created_at: now,
            updated_at: now,
        };
        let prompts = join_prompts(opts.prompts);

        self.mutate(
            &format!("checkpoint {id}: join session {}", opts.session_id),
            None,
            |store, entries| {
                if !Self::checkpoint_exists(entries, &prefix) {
                    return Err(EntireError::NotFound(id.as_str().to_string()));
                }
                if Self::is_legacy(entries, &prefix) {
                    store.migrate_legacy_entries(entries, &prefix)?;
                }
                let next = Self::session_indices(entries, &prefix)
                    .last()
                    .map(|i| i + 1)
                    .unwrap_or(0);
                store.write_session_entry(
                    entries,
                    &prefix,
                    next,
                    &metadata,
                    opts.transcript,
                    &prompts,
                    opts.context,
                )?;
                let summary = store.read_summary(entries, &prefix)?;
                store.rebuild_summary(entries, &prefix, summary)
            },
        )
    }

    /// Locate the session entry index carrying `session_id`, if any.
    /// Fails with `NotFound` when the checkpoint itself is absent.
    pub fn find_session_index(
        &self,
        id: &CheckpointId,
        session_id: &str,
    ) -> EntireResult<Option<usize>> {
        let entries = self.tip_entries()?;
        let prefix = id.tree_path();
        if !Self::checkpoint_exists(&entries, &prefix) {
            return Err(EntireError::NotFound(id.as_str().to_string()));
        }
        for index in Self::session_indices(&entries, &prefix) {
            if let Ok(metadata) = self.read_session_metadata(&entries, &prefix, index) {
                if metadata.session_id == session_id {
                    return Ok(Some(index));
                }
            }
        }
        Ok(None)
    }

    /// Read the aggregated root summary of a checkpoint.
    pub fn read_committed(&self, id: &CheckpointId) -> EntireResult<CheckpointSummary> {
        self.ensure_canonical(id)?;
        let entries = self.tip_entries()?;
        let prefix = id.tree_path();
        if !Self::checkpoint_exists(&entries, &prefix) {
            return Err(EntireError::NotFound(id.as_str().to_string()));
        }
        self.read_summary(&entries, &prefix)
    }

    /// Read one session entry's full content.
    pub fn read_session_content(
        &self,
        id: &CheckpointId,
        index: usize,
    ) -> EntireResult<SessionContent> {
        self.ensure_canonical(id)?;
        let entries = self.tip_entries()?;
        let prefix = id.tree_path();
        if !Self::checkpoint_exists(&entries, &prefix) {
            return Err(EntireError::NotFound(id.as_str().to_string()));
        }
        let base = format!("{prefix}/{index}");
        let metadata = self.read_session_metadata(&entries, &prefix, index)?;
        let transcript = self.blob(&entries, &format!("{base}/{TRANSCRIPT_FILE}"))?;
        let prompts = String::from_utf8_lossy(&self.blob(&entries, &format!("{base}/{PROMPT_FILE}"))?)
            .into_owned();
        let context = String::from_utf8_lossy(&self.blob(&entries, &format!("{base}/{CONTEXT_FILE}"))?)
            .into_owned();
        let stored_hash =
            String::from_utf8_lossy(&self.blob(&entries, &format!("{base}/{CONTENT_HASH_FILE}"))?)
                .into_owned();

        let expect = content_hash(
            &transcript,
            prompts.as_bytes(),
            context.as_bytes(),
            &metadata.files_touched,
        );
        if stored_hash != expect {
            return Err(EntireError::Corruption(format!(
                "{base}/{CONTENT_HASH_FILE}: hash mismatch"
            )));
        }

        Ok(SessionContent {
            metadata,
            transcript,
            prompts,
            context,
            content_hash: stored_hash,
        })
    }

    /// All checkpoint summaries reachable from the branch tip. Corrupt
    /// records are reported and skipped, never fatal.
    pub fn list_checkpoints(&self) -> EntireResult<Vec<CheckpointSummary>> {
        match self.tip()? {
            Some(tip) => self.list_checkpoints_reachable_from(tip),
            None => Ok(Vec::new()),
        }
    }

    /// Checkpoint summaries reachable from a specific commit on the
    /// metadata branch.
    pub fn list_checkpoints_reachable_from(&self, commit: Oid) -> EntireResult<Vec<CheckpointSummary>> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        let mut entries = BTreeMap::new();
        flatten_tree(self.repo, &tree, "", &mut entries)?;
        let mut summaries = Vec::new();
        for key in entries.keys() {
            let mut parts = key.splitn(3, '/');
            let (Some(shard), Some(rest), Some(file)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if file != METADATA_FILE || shard.len() != 2 || rest.len() != 10 {
                continue;
            }
            let prefix = format!("{shard}/{rest}");
            match self.read_summary(&entries, &prefix) {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(checkpoint = %prefix, error = %e, "skipping corrupt checkpoint"),
            }
        }
        Ok(summaries)
    }

    /// Append a commit to the summary's association list if absent.
    pub fn attach_commit(&self, id: &CheckpointId, commit_hex: &str) -> EntireResult<()> {
        let summary = self.read_committed(id)?;
        if summary.commits.iter().any(|c| c == commit_hex) {
            return Ok(());
        }
        let mut commits = summary.commits;
        commits.push(commit_hex.to_string());
        self.set_commits(id, &commits)
    }

    /// Replace the summary's commit association list.
    pub fn set_commits(&self, id: &CheckpointId, commits: &[String]) -> EntireResult<()> {
        let prefix = id.tree_path();
        self.mutate(&format!("checkpoint {id}: commits"), None, |store, entries| {
            let mut summary = store.read_summary(entries, &prefix)?;
            summary.commits = commits.to_vec();
            store.put(
                entries,
                format!("{prefix}/{METADATA_FILE}"),
                serde_json::to_string_pretty(&summary)?.as_bytes(),
            )
        })
    }

    /// Remove a checkpoint tree entirely (used by `clean`).
    pub fn remove_checkpoint(&self, id: &CheckpointId) -> EntireResult<()> {
        let prefix = id.tree_path();
        self.mutate(&format!("checkpoint {id}: remove"), None, |_, entries| {
            entries.retain(|k, _| !k.starts_with(&format!("{prefix}/")));
            Ok(())
        })
    }

    // -------------------------------------------------------------------
    // Legacy migration
    // -------------------------------------------------------------------

    /// Migrate a legacy checkpoint (session files at the checkpoint root,
    /// no numbered subdirectories) into the canonical nested form. Running
    /// on an already-canonical checkpoint is the identity.
    pub fn migrate_legacy(&self, id: &CheckpointId) -> EntireResult<()> {
        let prefix = id.tree_path();
        self.mutate(&format!("checkpoint {id}: migrate"), None, |store, entries| {
            if !Self::is_legacy(entries, &prefix) {
                return Ok(());
            }
            store.migrate_legacy_entries(entries, &prefix)
        })
    }

    fn ensure_canonical(&self, id: &CheckpointId) -> EntireResult<()> {
        let entries = self.tip_entries()?;
        if Self::is_legacy(&entries, &id.tree_path()) {
            self.migrate_legacy(id)?;
        }
        Ok(())
    }

    fn migrate_legacy_entries(
        &self,
        entries: &mut BTreeMap<String, TreeEntry>,
        prefix: &str,
    ) -> EntireResult<()> {
        // In the legacy layout the root metadata.json is the session
        // metadata itself.
        let raw = self.blob(entries, &format!("{prefix}/{METADATA_FILE}"))?;
        let metadata: SessionMetadata = serde_json::from_slice(&raw)
            .map_err(|e| EntireError::Corruption(format!("{prefix}/{METADATA_FILE}: {e}")))?;

        let transcript = self
            .blob(entries, &format!("{prefix}/{TRANSCRIPT_FILE}"))
            .unwrap_or_default();
        let prompts = self
            .blob(entries, &format!("{prefix}/{PROMPT_FILE}"))
            .unwrap_or_default();
        let context = self
            .blob(entries, &format!("{prefix}/{CONTEXT_FILE}"))
            .unwrap_or_default();

        for file in [
            METADATA_FILE,
            TRANSCRIPT_FILE,
            PROMPT_FILE,
            CONTEXT_FILE,
            CONTENT_HASH_FILE,
        ] {
            entries.remove(&format!("{prefix}/{file}"));
        }

        self.write_session_entry(
            entries,
            prefix,
            0,
            &metadata,
            &transcript,
            &String::from_utf8_lossy(&prompts),
            &context,
        )?;

        let checkpoint_id = prefix.replace('/', "");
        let summary = CheckpointSummary {
            checkpoint_id,
            strategy: StrategyKind::ManualCommit,
            branch: String::new(),
            checkpoints_count: 0,
            files_touched: Vec::new(),
            sessions: Vec::new(),
            token_usage: TokenUsage::default(),
            commits: Vec::new(),
        };
        self.rebuild_summary(entries, prefix, summary)
    }
}
