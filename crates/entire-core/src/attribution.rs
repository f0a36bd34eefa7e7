//! Commit attribution: linking recorded turns to user commits.
//!
//! Runs at post-commit (and read-only at pre-push). Attribution is
//! content-aware, not path-aware: a turn matches a commit when the blob
//! the turn produced for a path equals the blob the commit carries for
//! that path. Ties between turns producing identical content are broken
//! by (a) turn-end timestamp closest to, but not after, the commit
//! timestamp, (b) excluding paths a previous commit already claimed,
//! (c) lexicographic checkpoint ID.
//!
//! When a commit stages only part of a turn's files, the rest stay
//! associated with the turn as carry-forward and match a later commit
//! without being double-counted.

use std::collections::BTreeMap;

use git2::{Oid, Repository};
use tracing::{debug, warn};

use crate::error::{EntireError, EntireResult};
use crate::id::CheckpointId;
use crate::paths::RepoPaths;
use crate::session::{SessionState, SessionStore};
use crate::shadow::ShadowStore;
use crate::store::MetadataStore;
use crate::strategy::Strategy;

/// Attribution engine for one repository.
pub struct Attributor<'r> {
    repo: &'r Repository,
    sessions: SessionStore,
    store: MetadataStore<'r>,
    shadow: ShadowStore<'r>,
    strategy: &'r dyn Strategy,
}

/// One winning `(turn, path)` pairing for a commit.
struct PathClaim {
    session_index: usize,
    record_index: usize,
}

impl<'r> Attributor<'r> {
    pub fn new(repo: &'r Repository, paths: &'r RepoPaths, strategy: &'r dyn Strategy) -> Self {
        Attributor {
            repo,
            sessions: SessionStore::new(&paths.metadata_dir),
            store: MetadataStore::new(repo, paths),
            shadow: ShadowStore::new(repo, paths),
            strategy,
        }
    }

    /// A commit was created: replace amended commits, attribute matching
    /// turns, advance shadow refs, and mark carry-forward files.
    pub fn commit_created(&self, commit_oid: Oid) -> EntireResult<()> {
        let commit = self.repo.find_commit(commit_oid)?;
        let changes = self.commit_changes(&commit)?;
        let commit_hex = commit_oid.to_string();
        let commit_secs = commit.time().seconds();

        self.replace_amended(&commit)?;

        let mut states = self.sessions.list_all()?;

        // Per path, pick the winning turn among all that produced the
        // committed content.
        let mut claims: BTreeMap<String, PathClaim> = BTreeMap::new();
        for (path, blob) in &changes {
            let blob_hex = blob.to_string();
            let mut best: Option<(usize, usize)> = None;
            for (si, state) in states.iter().enumerate() {
                for (ri, record) in state.turn_records.iter().enumerate() {
                    if record.consumed.contains(path) {
                        continue; // already claimed by a previous commit
                    }
                    if record.files.get(path) != Some(&blob_hex) {
                        continue;
                    }
                    if record.ended_at.timestamp() > commit_secs {
                        continue; // turn ended after the commit
                    }
                    best = match best {
                        None => Some((si, ri)),
                        Some(current) => {
                            Some(self.better_claim(&states, current, (si, ri), commit_secs))
                        }
                    };
                }
            }
            if let Some((session_index, record_index)) = best {
                claims.insert(
                    path.clone(),
                    PathClaim {
                        session_index,
                        record_index,
                    },
                );
            }
        }

        if claims.is_empty() {
            debug!(commit = %commit_hex, "no turns attribute to commit");
            return Ok(());
        }

        // Group claimed paths per turn record and apply the outputs.
        let mut touched_sessions = std::collections::BTreeSet::new();
        let mut per_record: BTreeMap<(usize, usize), Vec<String>> = BTreeMap::new();
        for (path, claim) in claims {
            per_record
                .entry((claim.session_index, claim.record_index))
                .or_default()
                .push(path);
        }

        for ((si, ri), paths) in per_record {
            let record = &mut states[si].turn_records[ri];
            let checkpoint_id = record.checkpoint_id.clone();
            let snapshot_tree = record.snapshot_tree.clone();
            for path in &paths {
                record.consumed.insert(path.clone());
            }
            touched_sessions.insert(si);

            let id = CheckpointId::parse(&checkpoint_id)?;
            match self.store.attach_commit(&id, &commit_hex) {
                Ok(()) => {}
                Err(EntireError::NotFound(_)) | Err(EntireError::Corruption(_)) => {
                    warn!(checkpoint = %checkpoint_id, "skipping attribution for unreadable checkpoint");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if self.strategy.uses_shadow_branches() {
                if let Some(tree_hex) = snapshot_tree {
                    let tree = Oid::from_str(&tree_hex)?;
                    self.shadow
                        .upsert(&commit_hex, tree, &format!("attribute {checkpoint_id}"))?;
                }
            }
        }

        // Retire fully consumed records; persist carry-forward marks.
        for si in touched_sessions {
            let state = &mut states[si];
            state.turn_records.retain(|r| !r.fully_consumed());
            self.sessions.save(state)?;
        }

        Ok(())
    }

    /// Pre-push freeze: report outstanding carry-forward without mutating
    /// anything.
    pub fn about_to_publish(&self) -> EntireResult<()> {
        for state in self.sessions.list_all()? {
            for record in &state.turn_records {
                let outstanding: Vec<&String> = record.carried_forward().collect();
                if !outstanding.is_empty() {
                    debug!(
                        session = %state.session_id,
                        checkpoint = %record.checkpoint_id,
                        files = outstanding.len(),
                        "carry-forward outstanding at push"
                    );
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    /// File content the commit introduced: `path -> blob` for added and
    /// modified files against the first parent (everything for a root
    /// commit).
    fn commit_changes(&self, commit: &git2::Commit<'_>) -> EntireResult<BTreeMap<String, Oid>> {
        let new_tree = commit.tree()?;
        let old_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };
        let diff = self
            .repo
            .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)?;

        let mut changes = BTreeMap::new();
        for delta in diff.deltas() {
            match delta.status() {
                git2::Delta::Added | git2::Delta::Modified | git2::Delta::Renamed
                | git2::Delta::Copied => {
                    if let Some(path) = delta.new_file().path() {
                        changes.insert(
                            path.to_string_lossy().replace('\\', "/"),
                            delta.new_file().id(),
                        );
                    }
                }
                _ => {}
            }
        }
        Ok(changes)
    }

    /// Tiebreak between two candidate `(session, record)` claims for the
    /// same path: end timestamp closest to (but not after, at commit-time
    /// granularity) the commit, then lexicographic checkpoint ID. Both
    /// candidates already passed the not-after filter, so the one that
    /// ended latest is the closest.
    fn better_claim(
        &self,
        states: &[SessionState],
        a: (usize, usize),
        b: (usize, usize),
        _commit_secs: i64,
    ) -> (usize, usize) {
        let record_a = &states[a.0].turn_records[a.1];
        let record_b = &states[b.0].turn_records[b.1];
        if record_a.ended_at != record_b.ended_at {
            return if record_a.ended_at > record_b.ended_at { a } else { b };
        }
        if record_a.checkpoint_id <= record_b.checkpoint_id {
            a
        } else {
            b
        }
    }

    /// Detect an amend: a previously attributed commit with the same
    /// parents as the new commit that is no longer reachable from any
    /// user branch. The new commit replaces it in the checkpoint's
    /// `commits` list, and the shadow ref moves.
    fn replace_amended(&self, new_commit: &git2::Commit<'_>) -> EntireResult<()> {
        let new_hex = new_commit.id().to_string();
        let new_parents: Vec<Oid> = new_commit.parent_ids().collect();

        for summary in self.store.list_checkpoints()? {
            for old_hex in summary.commits.clone() {
                if old_hex == new_hex {
                    continue;
                }
                let Ok(old_oid) = Oid::from_str(&old_hex) else {
                    continue;
                };
                let Ok(old_commit) = self.repo.find_commit(old_oid) else {
                    continue; // pruned already
                };
                let old_parents: Vec<Oid> = old_commit.parent_ids().collect();
                if old_parents != new_parents {
                    continue;
                }
                if self.reachable_from_user_branch(old_oid)? {
                    continue; // a sibling commit, not an amend
                }

                let id = CheckpointId::parse(&summary.checkpoint_id)?;
                let mut commits = summary.commits.clone();
                commits.retain(|c| c != &old_hex);
                if !commits.contains(&new_hex) {
                    commits.push(new_hex.clone());
                }
                self.store.set_commits(&id, &commits)?;

                if self.strategy.uses_shadow_branches() {
                    self.shadow.rename(&old_hex, &new_hex)?;
                }
                debug!(old = %old_hex, new = %new_hex, "amended commit replaced");
            }
        }
        Ok(())
    }

    /// Whether a commit is reachable from any non-engine local branch.
    fn reachable_from_user_branch(&self, oid: Oid) -> EntireResult<bool> {
        for branch in self.repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = branch?;
            let name = branch.get().shorthand().unwrap_or("");
            if name.starts_with(crate::paths::SHADOW_PREFIX) {
                continue;
            }
            let Some(tip) = branch.get().target() else {
                continue;
            };
            if tip == oid || self.repo.graph_descendant_of(tip, oid)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
