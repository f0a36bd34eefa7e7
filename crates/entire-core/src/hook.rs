//! Hook dispatch: external lifecycle events in, state transitions out.
//!
//! The engine is embedded in short-lived hook processes. Agent hooks
//! deliver a JSON payload on stdin (`session_id`, `transcript_path`, and
//! event-specific fields); git hooks carry no payload and are resolved
//! against the repository directly. Each dispatch acquires the
//! coordinator lock for the affected session, runs the transition, and
//! reports whether it beat its soft deadline.
//!
//! Exit codes: 0 success; 1 non-fatal engine error (the hook shell
//! continues, the user's git operation is never aborted); 2 fatal
//! misconfiguration.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use git2::Repository;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::attribution::Attributor;
use crate::error::{EntireError, EntireResult};
use crate::filter::{ArtifactFilter, NoopFilter};
use crate::lock::ScopedLock;
use crate::paths::RepoPaths;
use crate::strategy::{self, Strategy};
use crate::turn::TurnEngine;

/// Soft deadline for turn lifecycle events.
const TURN_DEADLINE: Duration = Duration::from_secs(5);
/// Soft deadline for commit events.
const COMMIT_DEADLINE: Duration = Duration::from_secs(2);

/// External lifecycle events the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    UserPromptSubmit,
    FileChange,
    PreTask,
    PostTask,
    Stop,
    SessionEnd,
    PostCommit,
    PrePush,
}

impl HookEvent {
    pub fn parse(s: &str) -> EntireResult<Self> {
        match s {
            "user-prompt-submit" => Ok(HookEvent::UserPromptSubmit),
            "file-change" => Ok(HookEvent::FileChange),
            "pre-task" => Ok(HookEvent::PreTask),
            "post-task" => Ok(HookEvent::PostTask),
            "stop" => Ok(HookEvent::Stop),
            "session-end" => Ok(HookEvent::SessionEnd),
            "post-commit" => Ok(HookEvent::PostCommit),
            "pre-push" => Ok(HookEvent::PrePush),
            other => Err(EntireError::Config(format!("unknown hook event: '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::UserPromptSubmit => "user-prompt-submit",
            HookEvent::FileChange => "file-change",
            HookEvent::PreTask => "pre-task",
            HookEvent::PostTask => "post-task",
            HookEvent::Stop => "stop",
            HookEvent::SessionEnd => "session-end",
            HookEvent::PostCommit => "post-commit",
            HookEvent::PrePush => "pre-push",
        }
    }

    fn is_commit_event(&self) -> bool {
        matches!(self, HookEvent::PostCommit | HookEvent::PrePush)
    }

    fn deadline(&self) -> Duration {
        if self.is_commit_event() {
            COMMIT_DEADLINE
        } else {
            TURN_DEADLINE
        }
    }
}

/// JSON payload an agent hook delivers on stdin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    /// Source-supplied event identity, when the host provides one.
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl HookInput {
    /// Parse a payload from a reader (the hook's stdin). An empty stream
    /// yields an empty payload; git hooks deliver nothing.
    pub fn from_reader<R: Read>(mut reader: R) -> EntireResult<Self> {
        let mut raw = String::new();
        reader.read_to_string(&mut raw)?;
        if raw.trim().is_empty() {
            return Ok(HookInput::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn require_session(&self) -> EntireResult<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| EntireError::Config("hook payload is missing session_id".into()))
    }

    /// Deterministic event identity for replay protection: a re-delivered
    /// payload hashes to the same ID and is discarded by the machine.
    ///
    /// Uses the source-supplied `event_id` when present. The derived
    /// fallback folds in the transcript length: a true re-delivery carries
    /// the same transcript state, while a later turn with an otherwise
    /// identical payload has grown it.
    pub fn event_id(&self, event: HookEvent) -> String {
        if let Some(id) = &self.event_id {
            return id.clone();
        }
        let transcript_len = self
            .transcript_path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        let mut hasher = Sha256::new();
        hasher.update(event.as_str().as_bytes());
        hasher.update(transcript_len.to_le_bytes());
        for part in [
            self.session_id.as_deref(),
            self.prompt.as_deref(),
            self.file_path.as_deref(),
            self.tool_use_id.as_deref(),
            self.agent_id.as_deref(),
        ] {
            hasher.update([0u8]);
            hasher.update(part.unwrap_or("").as_bytes());
        }
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Routes external events into the turn machine and attribution engine.
pub struct Dispatcher {
    repo: Repository,
    paths: RepoPaths,
    strategy: Box<dyn Strategy>,
    filter: Box<dyn ArtifactFilter>,
}

impl Dispatcher {
    /// Open the repository enclosing `start` and resolve the configured
    /// strategy, once per process.
    pub fn discover(start: &Path) -> EntireResult<Self> {
        let repo = Repository::discover(start).map_err(|_| EntireError::NotARepository)?;
        let paths = RepoPaths::from_repo(&repo)?;
        let strategy = strategy::resolve(&repo)?;
        Ok(Dispatcher {
            repo,
            paths,
            strategy,
            filter: Box::new(NoopFilter),
        })
    }

    /// Install a pre-persist artifact filter (the secret scanner seam).
    pub fn with_filter(mut self, filter: Box<dyn ArtifactFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn paths(&self) -> &RepoPaths {
        &self.paths
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }

    /// Dispatch one event. Overrunning the soft deadline logs a warning
    /// but never cancels an in-flight write.
    pub fn dispatch(&self, event: HookEvent, input: &HookInput) -> EntireResult<()> {
        let started = Instant::now();
        let result = self.route(event, input);
        let elapsed = started.elapsed();
        if elapsed > event.deadline() {
            warn!(
                event = event.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                "hook exceeded soft deadline"
            );
        }
        result
    }

    fn route(&self, event: HookEvent, input: &HookInput) -> EntireResult<()> {
        match event {
            HookEvent::UserPromptSubmit
            | HookEvent::FileChange
            | HookEvent::PreTask
            | HookEvent::PostTask
            | HookEvent::Stop
            | HookEvent::SessionEnd => self.route_turn_event(event, input),
            HookEvent::PostCommit => {
                let head = self
                    .repo
                    .head()?
                    .target()
                    .ok_or_else(|| EntireError::NotFound("HEAD commit".into()))?;
                Attributor::new(&self.repo, &self.paths, self.strategy.as_ref())
                    .commit_created(head)
            }
            HookEvent::PrePush => {
                Attributor::new(&self.repo, &self.paths, self.strategy.as_ref())
                    .about_to_publish()
            }
        }
    }

    fn route_turn_event(&self, event: HookEvent, input: &HookInput) -> EntireResult<()> {
        let session_id = input.require_session()?;
        crate::session::validate_session_id(session_id)?;
        let _lock = ScopedLock::session(&self.paths.metadata_dir, session_id)?;

        let engine = TurnEngine::new(&self.repo, &self.paths, self.strategy.as_ref(), self.filter.as_ref());
        let event_id = input.event_id(event);
        let transcript_path = input.transcript_path.as_deref();

        let head_before = self.repo.head().ok().and_then(|h| h.target());

        match event {
            HookEvent::UserPromptSubmit => engine.prompt_submit(
                session_id,
                input.prompt.as_deref().unwrap_or(""),
                transcript_path,
                &event_id,
            )?,
            HookEvent::FileChange => {
                let path = input.file_path.as_deref().ok_or_else(|| {
                    EntireError::Config("file-change payload is missing file_path".into())
                })?;
                engine.file_change(session_id, path, &event_id)?;
            }
            HookEvent::PreTask => {
                let task = input.tool_use_id.as_deref().ok_or_else(|| {
                    EntireError::Config("pre-task payload is missing tool_use_id".into())
                })?;
                engine.pre_task(session_id, task, &event_id)?;
            }
            HookEvent::PostTask => {
                let task = input.tool_use_id.as_deref().ok_or_else(|| {
                    EntireError::Config("post-task payload is missing tool_use_id".into())
                })?;
                engine.post_task(
                    session_id,
                    task,
                    input.agent_id.as_deref().unwrap_or(""),
                    transcript_path,
                    &event_id,
                )?;
            }
            HookEvent::Stop => engine.stop(session_id, transcript_path, &event_id)?,
            HookEvent::SessionEnd => engine.explicit_end(session_id, &event_id)?,
            _ => unreachable!("commit events are routed separately"),
        }

        // git2-created commits fire no hooks, so an auto-commit produced at
        // turn end is attributed here, after the session state is durable.
        if event == HookEvent::Stop && self.strategy.auto_commits_on_stop() {
            let head_after = self.repo.head().ok().and_then(|h| h.target());
            if let Some(new_head) = head_after {
                if head_before != Some(new_head) {
                    Attributor::new(&self.repo, &self.paths, self.strategy.as_ref())
                        .commit_created(new_head)?;
                }
            }
        }

        Ok(())
    }
}

/// Process exit code for a hook result, per the engine's propagation
/// policy: recoverable and engine-internal failures are non-fatal.
pub fn exit_code(result: &EntireResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(EntireError::NotARepository) | Err(EntireError::Config(_)) => 2,
        Err(_) => 1,
    }
}
