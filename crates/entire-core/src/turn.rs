//! Turn lifecycle state machine.
//!
//! A turn spans prompt-submit to stop (or timeout). Per session the
//! machine is IDLE initially and after every completed turn, ACTIVE while
//! a turn is in flight, and ENDED terminally. Nested pre-task/post-task
//! frames form a stack so subagent work produces its own checkpoint
//! distinct from the parent turn; the parent aggregates the files of
//! completed child frames.
//!
//! Every transition is idempotent on `(event_id, session_id)`: applied
//! event IDs are recorded in the session state and re-deliveries are
//! discarded. All mutations happen under the caller-held session lock.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Duration, Utc};
use git2::Repository;
use tracing::{debug, warn};

use crate::checkpoint::TokenUsage;
use crate::context;
use crate::error::{EntireError, EntireResult};
use crate::filter::{Artifact, ArtifactFilter, Filtered};
use crate::id::CheckpointId;
use crate::paths::RepoPaths;
use crate::session::{Phase, SessionState, SessionStore, TaskFrame, TurnRecord};
use crate::shadow::ShadowStore;
use crate::store::{MetadataStore, UpdateCommittedOptions, WriteCommittedOptions};
use crate::strategy::{is_default_branch, Strategy};
use crate::transcript;

/// An ACTIVE session with no event for longer than this is finalized as if
/// it had stopped, lazily, at the next dispatch.
const TURN_TIMEOUT_HOURS: i64 = 2;

/// Drives turn transitions for one repository.
pub struct TurnEngine<'r> {
    repo: &'r Repository,
    paths: &'r RepoPaths,
    sessions: SessionStore,
    store: MetadataStore<'r>,
    shadow: ShadowStore<'r>,
    strategy: &'r dyn Strategy,
    filter: &'r dyn ArtifactFilter,
}

impl<'r> TurnEngine<'r> {
    pub fn new(
        repo: &'r Repository,
        paths: &'r RepoPaths,
        strategy: &'r dyn Strategy,
        filter: &'r dyn ArtifactFilter,
    ) -> Self {
        TurnEngine {
            repo,
            paths,
            sessions: SessionStore::new(&paths.metadata_dir),
            store: MetadataStore::new(repo, paths),
            shadow: ShadowStore::new(repo, paths),
            strategy,
            filter,
        }
    }

    // -------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------

    /// A user submitted a prompt: IDLE → ACTIVE, mint the turn's checkpoint
    /// ID, and persist provisional artifacts. Ignored while ACTIVE.
    pub fn prompt_submit(
        &self,
        session_id: &str,
        prompt: &str,
        transcript_path: Option<&str>,
        event_id: &str,
    ) -> EntireResult<()> {
        let mut state = self.load_or_create(session_id)?;
        if !state.mark_event_applied(event_id) {
            return Ok(());
        }
        self.apply_timeout(&mut state)?;

        if let Some(path) = transcript_path {
            state.transcript_path = Some(path.to_string());
        }
        state.last_event_at = Utc::now();

        match state.phase {
            Phase::Active => {
                // Duplicate submission inside an open turn.
                debug!(session = session_id, "prompt_submit while ACTIVE, ignored");
                return self.sessions.save(&state);
            }
            Phase::Ended => {
                return Err(EntireError::Config(format!(
                    "session {session_id} has ended"
                )));
            }
            Phase::Idle => {}
        }

        let (head_commit, branch) = self.head()?;
        state.turn_prompts = vec![prompt.to_string()];

        // A concurrent session on the same worktree and base commit shares
        // the turn window: join its checkpoint instead of minting one.
        let id = match self.find_joinable_checkpoint(&state, &head_commit)? {
            Some(joined) => joined,
            None => {
                let id = self.mint(&mut state);
                if !self.suppressed(&branch) {
                    let transcript = self.read_session_transcript(&state, transcript_path)?;
                    let prompts = vec![prompt.to_string()];
                    if let Some(artifact) = self.run_filter(transcript, prompts, Vec::new()) {
                        self.write_provisional(&id, &state, &branch, &artifact, "")?;
                    }
                }
                id.as_str().to_string()
            }
        };

        state.phase = Phase::Active;
        state.current_turn_checkpoint_id = Some(id);
        self.sessions.save(&state)
    }

    /// The checkpoint of another session whose turn window this prompt
    /// falls into: a session that is still ACTIVE on the same worktree and
    /// base commit. Turns that already ended keep their own checkpoints.
    fn find_joinable_checkpoint(
        &self,
        state: &SessionState,
        head_commit: &str,
    ) -> EntireResult<Option<String>> {
        for other in self.sessions.list_all()? {
            if other.session_id == state.session_id
                || other.worktree_id != state.worktree_id
                || other.base_commit != head_commit
                || other.phase != Phase::Active
            {
                continue;
            }
            if let Some(id) = other.current_turn_checkpoint_id {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// The agent edited a file mid-turn: accumulate it.
    pub fn file_change(&self, session_id: &str, path: &str, event_id: &str) -> EntireResult<()> {
        let Some(mut state) = self.sessions.load(session_id)? else {
            debug!(session = session_id, "file_change for unknown session, ignored");
            return Ok(());
        };
        if !state.mark_event_applied(event_id) {
            return Ok(());
        }
        self.apply_timeout(&mut state)?;
        if state.phase == Phase::Active {
            state.pending_files.insert(path.to_string());
        }
        state.last_event_at = Utc::now();
        self.sessions.save(&state)
    }

    /// A subagent task is starting: push a nested frame with its own
    /// provisional checkpoint.
    pub fn pre_task(&self, session_id: &str, task_id: &str, event_id: &str) -> EntireResult<()> {
        let Some(mut state) = self.sessions.load(session_id)? else {
            debug!(session = session_id, "pre_task for unknown session, ignored");
            return Ok(());
        };
        if !state.mark_event_applied(event_id) {
            return Ok(());
        }
        self.apply_timeout(&mut state)?;
        if state.phase != Phase::Active {
            debug!(session = session_id, "pre_task outside ACTIVE, ignored");
            return self.sessions.save(&state);
        }

        let (_, branch) = self.head()?;
        let id = self.mint(&mut state);

        if !self.suppressed(&branch) {
            if let Some(artifact) = self.run_filter(Vec::new(), Vec::new(), Vec::new()) {
                self.write_provisional(&id, &state, &branch, &artifact, "")?;
            }
        }

        state.task_frames.push(TaskFrame {
            task_id: task_id.to_string(),
            checkpoint_id: id.as_str().to_string(),
            files_at_start: state.pending_files.clone(),
            started_at: Utc::now(),
        });
        state.last_event_at = Utc::now();
        self.sessions.save(&state)
    }

    /// A subagent task finished: finalize its frame's checkpoint, stamped
    /// with the subagent's identity; the parent turn absorbs its files.
    pub fn post_task(
        &self,
        session_id: &str,
        task_id: &str,
        agent_id: &str,
        transcript_path: Option<&str>,
        event_id: &str,
    ) -> EntireResult<()> {
        let Some(mut state) = self.sessions.load(session_id)? else {
            debug!(session = session_id, "post_task for unknown session, ignored");
            return Ok(());
        };
        if !state.mark_event_applied(event_id) {
            return Ok(());
        }
        self.apply_timeout(&mut state)?;
        if state.phase != Phase::Active {
            debug!(session = session_id, "post_task outside ACTIVE, ignored");
            return self.sessions.save(&state);
        }

        let Some(pos) = state.task_frames.iter().rposition(|f| f.task_id == task_id) else {
            warn!(session = session_id, task = task_id, "post_task without matching frame");
            return self.sessions.save(&state);
        };
        let frame = state.task_frames.remove(pos);

        let (_, branch) = self.head()?;
        let transcript = self.read_session_transcript(&state, transcript_path)?;
        let usage = transcript::scan_usage(&transcript);

        // Files the task produced: everything observed during the frame.
        let mut task_files: BTreeSet<String> =
            transcript::scan_files_touched(&transcript, &self.paths.repo_root);
        task_files.extend(state.pending_files.iter().cloned());
        let task_files: Vec<String> = task_files
            .difference(&frame.files_at_start)
            .cloned()
            .collect();

        // The parent turn aggregates the completed child's files.
        state.pending_files.extend(task_files.iter().cloned());

        if !self.suppressed(&branch) {
            let id = CheckpointId::parse(&frame.checkpoint_id)?;
            let ctx = context::render(&context::TurnContext {
                session_id: &state.session_id,
                branch: &branch,
                base_commit: &state.base_commit,
                started_at: frame.started_at,
                ended_at: Utc::now(),
                prompts: &[],
                files_touched: &task_files,
                token_usage: &usage,
            });
            if let Some(artifact) = self.run_filter(transcript, Vec::new(), ctx.into_bytes()) {
                self.finalize_checkpoint(&id, &state, &branch, &artifact, &task_files, usage, agent_id)?;
                state.turn_checkpoint_ids.push(frame.checkpoint_id.clone());
            }
        }

        state.last_event_at = Utc::now();
        self.sessions.save(&state)
    }

    /// The turn ended: persist the full transcript, context, and token
    /// totals; record the turn for attribution; ACTIVE → IDLE.
    ///
    /// A stop for an unknown session still produces exactly one checkpoint
    /// under that session ID and touches no other session.
    pub fn stop(
        &self,
        session_id: &str,
        transcript_path: Option<&str>,
        event_id: &str,
    ) -> EntireResult<()> {
        let mut state = match self.sessions.load(session_id)? {
            Some(state) => state,
            None => {
                let mut state = self.load_or_create(session_id)?;
                let id = self.mint(&mut state);
                state.phase = Phase::Active;
                state.current_turn_checkpoint_id = Some(id.as_str().to_string());
                state
            }
        };
        if !state.mark_event_applied(event_id) {
            return Ok(());
        }

        if let Some(path) = transcript_path {
            state.transcript_path = Some(path.to_string());
        }

        if state.phase != Phase::Active {
            debug!(session = session_id, "stop while not ACTIVE, noop");
            state.last_event_at = Utc::now();
            return self.sessions.save(&state);
        }

        self.finish_turn(&mut state, transcript_path)?;
        self.sessions.save(&state)
    }

    /// The session is over: → ENDED from any phase.
    pub fn explicit_end(&self, session_id: &str, event_id: &str) -> EntireResult<()> {
        let Some(mut state) = self.sessions.load(session_id)? else {
            return Ok(());
        };
        if !state.mark_event_applied(event_id) {
            return Ok(());
        }
        state.phase = Phase::Ended;
        state.current_turn_checkpoint_id = None;
        state.turn_prompts.clear();
        state.task_frames.clear();
        state.pending_files.clear();
        state.last_event_at = Utc::now();
        self.sessions.save(&state)
    }

    // -------------------------------------------------------------------
    // Turn completion
    // -------------------------------------------------------------------

    /// Shared completion path for `stop` and timeout.
    fn finish_turn(
        &self,
        state: &mut SessionState,
        transcript_path: Option<&str>,
    ) -> EntireResult<()> {
        let checkpoint_id = state
            .current_turn_checkpoint_id
            .clone()
            .ok_or_else(|| EntireError::Corruption("ACTIVE session without a turn checkpoint".into()))?;
        let id = CheckpointId::parse(&checkpoint_id)?;
        let (head_commit, branch) = self.head()?;

        let transcript_bytes = self.read_session_transcript(state, transcript_path)?;
        let usage = transcript::scan_usage(&transcript_bytes);

        let mut files: BTreeSet<String> =
            transcript::scan_files_touched(&transcript_bytes, &self.paths.repo_root);
        files.extend(state.pending_files.iter().cloned());
        let files: Vec<String> = files.into_iter().collect();

        let now = Utc::now();
        let suppressed = self.suppressed(&branch);
        let mut persisted = false;

        if !suppressed {
            let ctx = context::render(&context::TurnContext {
                session_id: &state.session_id,
                branch: &branch,
                base_commit: &state.base_commit,
                started_at: state.last_event_at,
                ended_at: now,
                prompts: &[],
                files_touched: &files,
                token_usage: &usage,
            });
            if let Some(artifact) = self.run_filter(transcript_bytes, Vec::new(), ctx.into_bytes())
            {
                self.finalize_checkpoint(&id, state, &branch, &artifact, &files, usage, "")?;
                persisted = true;
            }
        }

        if persisted {
            state.turn_checkpoint_ids.push(checkpoint_id.clone());

            // Capture the turn snapshot for attribution and rewind.
            let mut file_blobs = std::collections::BTreeMap::new();
            for path in &files {
                let full = self.paths.repo_root.join(path);
                if let Ok(data) = std::fs::read(&full) {
                    if let Ok(oid) = git2::Oid::hash_object(git2::ObjectType::Blob, &data) {
                        file_blobs.insert(path.clone(), oid.to_string());
                    }
                }
            }

            let snapshot_tree = if self.strategy.uses_shadow_branches() {
                let snapshot = self.shadow.snapshot_tree()?;
                self.shadow
                    .upsert(&head_commit, snapshot, &format!("turn end {id}"))?;
                // The shadow ref for HEAD exists, so the checkpoint must
                // list HEAD among its commits.
                self.store.attach_commit(&id, &head_commit)?;
                Some(snapshot.to_string())
            } else {
                None
            };

            state.turn_records.push(TurnRecord {
                checkpoint_id,
                ended_at: now,
                files: file_blobs,
                consumed: BTreeSet::new(),
                snapshot_tree,
            });
        }

        state.phase = Phase::Idle;
        state.current_turn_checkpoint_id = None;
        state.turn_prompts.clear();
        state.task_frames.clear();
        state.pending_files.clear();
        state.last_event_at = now;

        if persisted && self.strategy.auto_commits_on_stop() {
            match self.auto_commit(&id) {
                Ok(Some(oid)) => debug!(commit = %oid, "auto-commit created"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "auto-commit failed"),
            }
        }
        Ok(())
    }

    /// Persist a turn's final artifacts into its checkpoint: update this
    /// session's entry when it exists, append a new numbered entry when
    /// the session joined another session's checkpoint, or create the
    /// whole tree if the provisional write never happened.
    #[allow(clippy::too_many_arguments)]
    fn finalize_checkpoint(
        &self,
        id: &CheckpointId,
        state: &SessionState,
        branch: &str,
        artifact: &Artifact,
        files: &[String],
        usage: TokenUsage,
        agent: &str,
    ) -> EntireResult<()> {
        match self.store.find_session_index(id, &state.session_id) {
            Ok(Some(_)) => self.store.update_committed(
                id,
                UpdateCommittedOptions {
                    session_id: &state.session_id,
                    transcript: Some(&artifact.transcript),
                    prompts: if artifact.prompts.is_empty() {
                        None
                    } else {
                        Some(&artifact.prompts)
                    },
                    context: Some(&artifact.context),
                    token_usage: Some(usage),
                    files_touched: Some(files),
                    agent: if agent.is_empty() { None } else { Some(agent) },
                },
            ),
            Ok(None) => self.store.append_session(
                id,
                crate::store::AppendSessionOptions {
                    session_id: &state.session_id,
                    agent,
                    transcript: &artifact.transcript,
                    prompts: &state.turn_prompts,
                    context: &artifact.context,
                    files_touched: files,
                    token_usage: usage,
                },
            ),
            Err(EntireError::NotFound(_)) => self.store.write_committed(
                id,
                WriteCommittedOptions {
                    session_id: &state.session_id,
                    strategy: self.strategy.kind(),
                    branch,
                    agent,
                    transcript: &artifact.transcript,
                    prompts: &state.turn_prompts,
                    context: &artifact.context,
                    files_touched: files,
                    token_usage: usage,
                    author: None,
                },
            ),
            Err(e) => Err(e),
        }
    }

    fn write_provisional(
        &self,
        id: &CheckpointId,
        state: &SessionState,
        branch: &str,
        artifact: &Artifact,
        agent: &str,
    ) -> EntireResult<()> {
        let result = self.store.write_committed(
            id,
            WriteCommittedOptions {
                session_id: &state.session_id,
                strategy: self.strategy.kind(),
                branch,
                agent,
                transcript: &artifact.transcript,
                prompts: &artifact.prompts,
                context: &artifact.context,
                files_touched: &[],
                token_usage: TokenUsage::default(),
                author: None,
            },
        );
        match result {
            // A crashed previous invocation may have written it already.
            Err(EntireError::AlreadyExists(_)) => Ok(()),
            other => other,
        }
    }

    /// Produce a commit of the working tree on the current branch
    /// (auto-commit strategy, turn end). Stages everything; the working
    /// tree files themselves are untouched.
    fn auto_commit(&self, id: &CheckpointId) -> EntireResult<Option<git2::Oid>> {
        let statuses = self.repo.statuses(None)?;
        if statuses.is_empty() {
            return Ok(None);
        }

        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        let sig = match self.repo.signature() {
            Ok(sig) => sig,
            Err(_) => git2::Signature::now("entire", "entire@localhost")?,
        };
        let parent = self.repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_oid {
            return Ok(None);
        }
        let oid = self.repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("entire: turn {id}"),
            &tree,
            &[&parent],
        )?;
        Ok(Some(oid))
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    fn load_or_create(&self, session_id: &str) -> EntireResult<SessionState> {
        if let Some(state) = self.sessions.load(session_id)? {
            return Ok(state);
        }
        let (head_commit, _) = self.head()?;
        Ok(SessionState::new(session_id, &head_commit, &self.paths.worktree_id))
    }

    /// Current HEAD commit hex and branch shorthand.
    fn head(&self) -> EntireResult<(String, String)> {
        let head = self.repo.head()?;
        let commit = head
            .target()
            .ok_or_else(|| EntireError::NotFound("HEAD commit".to_string()))?;
        let branch = head.shorthand().unwrap_or("HEAD").to_string();
        Ok((commit.to_string(), branch))
    }

    fn suppressed(&self, branch: &str) -> bool {
        self.strategy.skips_default_branch() && is_default_branch(self.repo, branch)
    }

    fn mint(&self, state: &mut SessionState) -> CheckpointId {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = state.next_seq();
        CheckpointId::mint(timestamp_ns, &state.session_id, &state.base_commit, seq)
    }

    fn read_session_transcript(
        &self,
        state: &SessionState,
        override_path: Option<&str>,
    ) -> EntireResult<Vec<u8>> {
        let path = override_path.or(state.transcript_path.as_deref());
        match path {
            Some(p) => transcript::read_transcript(Path::new(p)),
            None => Ok(Vec::new()),
        }
    }

    fn run_filter(
        &self,
        transcript: Vec<u8>,
        prompts: Vec<String>,
        context: Vec<u8>,
    ) -> Option<Artifact> {
        match self.filter.filter(Artifact {
            transcript,
            prompts,
            context,
        }) {
            Filtered::Pass(artifact) => Some(artifact),
            Filtered::Reject { reason } => {
                warn!(reason = %reason, "artifact rejected by pre-persist filter");
                None
            }
        }
    }

    /// Lazily finalize a turn whose session went silent past the timeout.
    fn apply_timeout(&self, state: &mut SessionState) -> EntireResult<()> {
        if state.phase != Phase::Active {
            return Ok(());
        }
        let deadline = state.last_event_at + Duration::hours(TURN_TIMEOUT_HOURS);
        if Utc::now() > deadline {
            warn!(session = %state.session_id, "turn timed out, finalizing");
            self.finish_turn(state, None)?;
        }
        Ok(())
    }
}
