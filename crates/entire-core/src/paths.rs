//! Repository, worktree, and metadata path resolution.
//!
//! All engine state lives under the git directory, never in the working
//! tree: session state files in `<gitdir>/entire-sessions/`, checkpoint
//! artifacts on the `entire/checkpoints/v1` branch, and per-commit snapshot
//! refs under `entire/`. Linked worktrees share the common git directory,
//! so an 8-hex worktree ID disambiguates their shadow refs and locks.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{EntireError, EntireResult};

/// Directory under the git dir holding per-session state files.
pub const SESSIONS_DIR: &str = "entire-sessions";

/// Branch holding all checkpoint artifacts. Never checked out.
pub const METADATA_BRANCH: &str = "entire/checkpoints/v1";

/// Full ref name of the metadata branch.
pub const METADATA_REF: &str = "refs/heads/entire/checkpoints/v1";

/// Prefix shared by shadow branches (`entire/<short-commit>-<worktree-id>`).
pub const SHADOW_PREFIX: &str = "entire/";

/// File names inside a checkpoint's session entry directory.
pub const METADATA_FILE: &str = "metadata.json";
pub const PROMPT_FILE: &str = "prompt.txt";
pub const TRANSCRIPT_FILE: &str = "full.jsonl";
pub const CONTEXT_FILE: &str = "context.md";
pub const CONTENT_HASH_FILE: &str = "content_hash.txt";

/// Resolved locations for one repository + worktree pair.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    /// Root of the working tree.
    pub repo_root: PathBuf,
    /// The git directory for this worktree (`.git` or a linked worktree's gitdir).
    pub git_dir: PathBuf,
    /// The common git directory shared by all linked worktrees.
    pub common_dir: PathBuf,
    /// `<common-dir>/entire-sessions/`.
    pub metadata_dir: PathBuf,
    /// Stable 8-hex digest over the absolute worktree path.
    pub worktree_id: String,
}

impl RepoPaths {
    /// Resolve paths from any directory inside a repository.
    ///
    /// Fails with `NotARepository` if no enclosing git directory exists.
    pub fn discover(start: &Path) -> EntireResult<Self> {
        let repo = git2::Repository::discover(start).map_err(|_| EntireError::NotARepository)?;
        Self::from_repo(&repo)
    }

    /// Resolve paths from an already-open repository handle.
    pub fn from_repo(repo: &git2::Repository) -> EntireResult<Self> {
        let repo_root = repo
            .workdir()
            .ok_or_else(|| EntireError::Config("repository is bare, no working tree".into()))?
            .to_path_buf();
        let git_dir = repo.path().to_path_buf();
        let common_dir = repo.commondir().to_path_buf();
        let metadata_dir = common_dir.join(SESSIONS_DIR);
        let worktree_id = worktree_id(&repo_root);

        Ok(Self {
            repo_root,
            git_dir,
            common_dir,
            metadata_dir,
            worktree_id,
        })
    }
}

/// Stable 8-hex identifier for a worktree, derived from its absolute path.
pub fn worktree_id(worktree_path: &Path) -> String {
    let canonical = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Shadow branch name for a `(commit, worktree)` pair:
/// `entire/<7-hex-short-commit>-<8-hex-worktree-id>`.
pub fn shadow_branch_name(commit: &str, worktree_id: &str) -> String {
    let short: String = commit.chars().take(7).collect();
    format!("{SHADOW_PREFIX}{short}-{worktree_id}")
}

/// Full ref name of a shadow branch.
pub fn shadow_ref_name(commit: &str, worktree_id: &str) -> String {
    format!("refs/heads/{}", shadow_branch_name(commit, worktree_id))
}

/// Parse a shadow branch name into its `(short_commit, worktree_id)` parts.
///
/// Returns `None` for the metadata branch and anything else under `entire/`
/// that does not match the `<7-hex>-<8-hex>` shape.
pub fn parse_shadow_branch_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(SHADOW_PREFIX)?;
    let (short, wt) = rest.split_once('-')?;
    let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if short.len() == 7 && wt.len() == 8 && is_hex(short) && is_hex(wt) {
        Some((short, wt))
    } else {
        None
    }
}
