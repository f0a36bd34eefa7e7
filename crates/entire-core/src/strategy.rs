//! Checkpoint persistence strategies.
//!
//! Two strategies share the turn machine, dispatcher, and attribution
//! engine but differ in how rewind points materialize: `manual-commit`
//! records working-tree snapshots on shadow branches and waits for the
//! user to commit; `auto-commit` produces a commit at turn end and skips
//! checkpoints on the repository's default branch entirely.
//!
//! Optional capabilities (`Reset`, `Clean`) are feature-detected through
//! accessor methods rather than required trait methods; an unsupported
//! operation fails with a strategy-specific explanation.

use git2::Repository;
use tracing::warn;

use crate::checkpoint::StrategyKind;
use crate::error::{EntireError, EntireResult};
use crate::paths::RepoPaths;
use crate::session::SessionStore;
use crate::shadow::ShadowStore;

/// Git config key selecting the strategy for a repository.
pub const STRATEGY_CONFIG_KEY: &str = "entire.strategy";

/// Shared context handed to capability implementations.
pub struct StrategyContext<'r> {
    pub repo: &'r Repository,
    pub paths: &'r RepoPaths,
}

/// Result of a `Reset`.
pub struct ResetOutcome {
    pub cleared_sessions: Vec<String>,
    pub deleted_shadow: Option<String>,
}

/// Filter for `Clean`.
#[derive(Default)]
pub struct CleanFilter {
    /// Only remove sessions in the ENDED phase.
    pub ended_only: bool,
    /// Only remove sessions whose base commit starts with this prefix.
    pub base_commit_prefix: Option<String>,
}

/// Result of a `Clean`.
pub struct CleanOutcome {
    pub removed_sessions: Vec<String>,
}

/// Optional capability: delete the shadow branch and session state for the
/// current HEAD, allowing a fresh start.
pub trait Reset {
    fn reset(&self, ctx: &StrategyContext<'_>) -> EntireResult<ResetOutcome>;
}

/// Optional capability: remove session state files matching a filter.
pub trait Clean {
    fn clean(&self, ctx: &StrategyContext<'_>, filter: &CleanFilter) -> EntireResult<CleanOutcome>;
}

/// A checkpoint persistence policy.
pub trait Strategy {
    fn kind(&self) -> StrategyKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Whether turn ends record working-tree snapshots on shadow branches.
    fn uses_shadow_branches(&self) -> bool;

    /// Whether turn-end and task checkpoints are skipped on the default
    /// branch.
    fn skips_default_branch(&self) -> bool;

    /// Whether a commit is produced automatically at turn end.
    fn auto_commits_on_stop(&self) -> bool;

    fn resetter(&self) -> Option<&dyn Reset> {
        None
    }

    fn cleaner(&self) -> Option<&dyn Clean> {
        None
    }
}

/// Error for an operation a strategy does not support.
pub fn unsupported(strategy: &dyn Strategy, operation: &str) -> EntireError {
    let hint = match strategy.kind() {
        StrategyKind::AutoCommit => {
            "the auto-commit strategy doesn't use shadow branches; use git directly: git reset --hard <commit>"
        }
        StrategyKind::ManualCommit => "not supported by the manual-commit strategy",
    };
    EntireError::Config(format!(
        "strategy {} does not support {operation}: {hint}",
        strategy.name()
    ))
}

// ---------------------------------------------------------------------------
// manual-commit
// ---------------------------------------------------------------------------

pub struct ManualCommit;

impl Strategy for ManualCommit {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ManualCommit
    }

    fn uses_shadow_branches(&self) -> bool {
        true
    }

    fn skips_default_branch(&self) -> bool {
        false
    }

    fn auto_commits_on_stop(&self) -> bool {
        false
    }

    fn resetter(&self) -> Option<&dyn Reset> {
        Some(self)
    }

    fn cleaner(&self) -> Option<&dyn Clean> {
        Some(self)
    }
}

impl Reset for ManualCommit {
    /// Delete the shadow branch and all session state for the current HEAD
    /// in this worktree. Ref-only; objects are reclaimed by git GC.
    fn reset(&self, ctx: &StrategyContext<'_>) -> EntireResult<ResetOutcome> {
        let head = ctx
            .repo
            .head()?
            .target()
            .ok_or_else(|| EntireError::NotFound("HEAD".to_string()))?
            .to_string();

        let sessions = SessionStore::new(&ctx.paths.metadata_dir);
        let mut cleared = Vec::new();
        for state in sessions.find_by_base_commit(&head)? {
            match sessions.delete(&state.session_id) {
                Ok(()) => cleared.push(state.session_id),
                Err(e) => warn!(session = %state.session_id, error = %e, "failed to clear session state"),
            }
        }

        let shadow = ShadowStore::new(ctx.repo, ctx.paths);
        let deleted_shadow = if shadow.delete(&head)? {
            Some(crate::paths::shadow_branch_name(&head, &ctx.paths.worktree_id))
        } else {
            None
        };

        Ok(ResetOutcome {
            cleared_sessions: cleared,
            deleted_shadow,
        })
    }
}

impl Clean for ManualCommit {
    fn clean(&self, ctx: &StrategyContext<'_>, filter: &CleanFilter) -> EntireResult<CleanOutcome> {
        clean_sessions(ctx, filter)
    }
}

// ---------------------------------------------------------------------------
// auto-commit
// ---------------------------------------------------------------------------

pub struct AutoCommit;

impl Strategy for AutoCommit {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AutoCommit
    }

    fn uses_shadow_branches(&self) -> bool {
        false
    }

    fn skips_default_branch(&self) -> bool {
        true
    }

    fn auto_commits_on_stop(&self) -> bool {
        true
    }

    fn cleaner(&self) -> Option<&dyn Clean> {
        Some(self)
    }
}

impl Clean for AutoCommit {
    fn clean(&self, ctx: &StrategyContext<'_>, filter: &CleanFilter) -> EntireResult<CleanOutcome> {
        clean_sessions(ctx, filter)
    }
}

fn clean_sessions(ctx: &StrategyContext<'_>, filter: &CleanFilter) -> EntireResult<CleanOutcome> {
    let sessions = SessionStore::new(&ctx.paths.metadata_dir);
    let mut removed = Vec::new();
    for state in sessions.list_all()? {
        if filter.ended_only && state.phase != crate::session::Phase::Ended {
            continue;
        }
        if let Some(prefix) = &filter.base_commit_prefix {
            if !state.base_commit.starts_with(prefix.as_str()) {
                continue;
            }
        }
        match sessions.delete(&state.session_id) {
            Ok(()) => removed.push(state.session_id),
            Err(e) => warn!(session = %state.session_id, error = %e, "failed to remove session state"),
        }
    }
    Ok(CleanOutcome {
        removed_sessions: removed,
    })
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the configured strategy for a repository, once per process.
/// Defaults to `manual-commit` when unset.
pub fn resolve(repo: &Repository) -> EntireResult<Box<dyn Strategy>> {
    let configured = repo
        .config()
        .and_then(|mut c| c.snapshot())
        .ok()
        .and_then(|c| c.get_string(STRATEGY_CONFIG_KEY).ok());

    match configured.as_deref() {
        None => Ok(Box::new(ManualCommit)),
        Some(name) => match name.parse::<StrategyKind>() {
            Ok(StrategyKind::ManualCommit) => Ok(Box::new(ManualCommit)),
            Ok(StrategyKind::AutoCommit) => Ok(Box::new(AutoCommit)),
            Err(e) => Err(EntireError::Config(e)),
        },
    }
}

/// The repository's default branch: the symbolic target of
/// `refs/remotes/origin/HEAD` when present, otherwise a local branch named
/// `main` or `master`.
pub fn default_branch(repo: &Repository) -> Option<String> {
    if let Ok(origin_head) = repo.find_reference("refs/remotes/origin/HEAD") {
        if let Some(target) = origin_head.symbolic_target() {
            if let Some(name) = target.strip_prefix("refs/remotes/origin/") {
                return Some(name.to_string());
            }
        }
    }
    for candidate in ["main", "master"] {
        if repo.find_branch(candidate, git2::BranchType::Local).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Whether `branch` is the repository's default branch. With no resolvable
/// default, the conventional names still count.
pub fn is_default_branch(repo: &Repository, branch: &str) -> bool {
    match default_branch(repo) {
        Some(default) => branch == default,
        None => matches!(branch, "main" | "master"),
    }
}
