//! Shadow branches: per-commit, per-worktree rewind refs.
//!
//! Under the manual-commit strategy, each `(commit, worktree)` pair gets a
//! branch `entire/<short-commit>-<worktree-id>` whose tip commit's tree is
//! the working-tree snapshot at the moment a turn ended. Snapshots are
//! built from bare objects; deletion removes only the ref, so unreferenced
//! history is reclaimed by ordinary git GC.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use git2::{Oid, Repository, Signature};
use walkdir::WalkDir;

use crate::error::{EntireError, EntireResult};
use crate::gittree::{build_tree, TreeEntry};
use crate::lock::ScopedLock;
use crate::paths::{parse_shadow_branch_name, shadow_ref_name, RepoPaths};

/// Shadow ref store for one repository + worktree pair.
pub struct ShadowStore<'r> {
    repo: &'r Repository,
    repo_root: PathBuf,
    metadata_dir: PathBuf,
    worktree_id: String,
}

impl<'r> ShadowStore<'r> {
    pub fn new(repo: &'r Repository, paths: &RepoPaths) -> Self {
        ShadowStore {
            repo,
            repo_root: paths.repo_root.clone(),
            metadata_dir: paths.metadata_dir.clone(),
            worktree_id: paths.worktree_id.clone(),
        }
    }

    fn signature(&self) -> EntireResult<Signature<'static>> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(Signature::now("entire", "entire@localhost")?),
        }
    }

    /// Capture the current working tree as a tree object, honoring the
    /// repository's ignore rules. Nothing in the working tree is modified.
    pub fn snapshot_tree(&self) -> EntireResult<Oid> {
        let mut entries: BTreeMap<String, TreeEntry> = BTreeMap::new();

        for entry in WalkDir::new(&self.repo_root)
            .into_iter()
            .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.repo_root) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if self.repo.is_path_ignored(&rel_str).unwrap_or(false) {
                continue;
            }

            let data = match fs::read(entry.path()) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let oid = self.repo.blob(&data)?;
            let executable = is_executable(entry.path());
            entries.insert(rel_str, TreeEntry { oid, executable });
        }

        build_tree(self.repo, &entries)
    }

    /// Create the shadow branch for a commit, or fast-forward it with a new
    /// snapshot. Returns the branch's short name.
    pub fn upsert(&self, commit: &str, snapshot: Oid, message: &str) -> EntireResult<String> {
        let _lock = ScopedLock::worktree(&self.metadata_dir, &self.worktree_id)?;

        let ref_name = shadow_ref_name(commit, &self.worktree_id);
        let sig = self.signature()?;
        let tree = self.repo.find_tree(snapshot)?;

        match self.repo.find_reference(&ref_name) {
            Ok(existing) => {
                let old = existing
                    .target()
                    .ok_or_else(|| EntireError::NotFound(ref_name.clone()))?;
                let parent = self.repo.find_commit(old)?;
                if parent.tree_id() != snapshot {
                    let new = self
                        .repo
                        .commit(None, &sig, &sig, message, &tree, &[&parent])?;
                    self.repo
                        .reference_matching(&ref_name, new, true, old, message)?;
                }
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                let new = self.repo.commit(None, &sig, &sig, message, &tree, &[])?;
                self.repo.reference(&ref_name, new, false, message)?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(ref_name
            .strip_prefix("refs/heads/")
            .unwrap_or(&ref_name)
            .to_string())
    }

    /// Find the shadow branch for a commit in this worktree, returning its
    /// short name and tip.
    pub fn find_for_commit(&self, commit: &str) -> EntireResult<Option<(String, Oid)>> {
        let ref_name = shadow_ref_name(commit, &self.worktree_id);
        match self.repo.find_reference(&ref_name) {
            Ok(r) => {
                let tip = r.target().ok_or_else(|| EntireError::NotFound(ref_name.clone()))?;
                let short = ref_name.strip_prefix("refs/heads/").unwrap_or(&ref_name);
                Ok(Some((short.to_string(), tip)))
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the shadow branch for a commit. Touches only the ref.
    pub fn delete(&self, commit: &str) -> EntireResult<bool> {
        let _lock = ScopedLock::worktree(&self.metadata_dir, &self.worktree_id)?;
        let ref_name = shadow_ref_name(commit, &self.worktree_id);
        match self.repo.find_reference(&ref_name) {
            Ok(mut r) => {
                r.delete()?;
                Ok(true)
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a commit's shadow branch to a new commit name (amend handling).
    /// The tip commit is reused; only refs change.
    pub fn rename(&self, old_commit: &str, new_commit: &str) -> EntireResult<bool> {
        let _lock = ScopedLock::worktree(&self.metadata_dir, &self.worktree_id)?;
        let old_ref = shadow_ref_name(old_commit, &self.worktree_id);
        let new_ref = shadow_ref_name(new_commit, &self.worktree_id);
        match self.repo.find_reference(&old_ref) {
            Ok(mut r) => {
                let tip = r.target().ok_or_else(|| EntireError::NotFound(old_ref.clone()))?;
                self.repo.reference(&new_ref, tip, true, "shadow rename")?;
                r.delete()?;
                Ok(true)
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Short names of all shadow branches belonging to this worktree.
    pub fn list(&self) -> EntireResult<Vec<String>> {
        let mut names = Vec::new();
        for branch in self.repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                if let Some((_, wt)) = parse_shadow_branch_name(name) {
                    if wt == self.worktree_id {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &std::path::Path) -> bool {
    false
}
