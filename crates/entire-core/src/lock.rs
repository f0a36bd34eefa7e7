//! Advisory file locks for multi-process coordination.
//!
//! The engine runs inside short-lived hook processes, so coordination uses
//! `flock(2)` (via the `fs2` crate) rather than in-process mutexes. The OS
//! releases a lock when its owner exits or crashes, so lock files never go
//! stale and are never deleted.
//!
//! Three lock scopes exist, all under the metadata directory:
//! - per-session (`<session-id>.lock`): serializes all mutators for one session
//! - metadata ref (`metadata-ref.lock`): held across the read-ref, build-tree,
//!   CAS-ref window of metadata branch writes
//! - per-worktree (`worktree-<id>.lock`): serializes shadow ref updates

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{EntireError, EntireResult};

/// Default acquisition timeout for hook-driven mutators.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// An exclusive advisory lock, released on drop.
pub struct ScopedLock {
    _file: File,
}

impl ScopedLock {
    /// Acquire an exclusive lock on `<dir>/<name>`.
    ///
    /// Polls with a short sleep interval until the lock is acquired or the
    /// timeout expires. Returns `EntireError::Busy` on timeout.
    pub fn acquire(dir: &Path, name: &str, timeout: Duration) -> EntireResult<Self> {
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(ScopedLock { _file: file }),
                Err(_) if start.elapsed() >= timeout => {
                    return Err(EntireError::Busy(name.to_string()));
                }
                Err(_) => std::thread::sleep(poll_interval),
            }
        }
    }

    /// Lock serializing all mutators for one session.
    ///
    /// The session ID must already be validated (see `session::validate_session_id`)
    /// before being spliced into a filename.
    pub fn session(metadata_dir: &Path, session_id: &str) -> EntireResult<Self> {
        Self::acquire(metadata_dir, &format!("{session_id}.lock"), LOCK_TIMEOUT)
    }

    /// Lock serializing ref updates to the metadata branch.
    pub fn metadata_ref(metadata_dir: &Path) -> EntireResult<Self> {
        Self::acquire(metadata_dir, "metadata-ref.lock", LOCK_TIMEOUT)
    }

    /// Lock serializing shadow ref updates for one worktree.
    pub fn worktree(metadata_dir: &Path, worktree_id: &str) -> EntireResult<Self> {
        Self::acquire(metadata_dir, &format!("worktree-{worktree_id}.lock"), LOCK_TIMEOUT)
    }
}
