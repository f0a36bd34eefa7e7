//! Read-side queries for the CLI front-end.

use chrono::{DateTime, Utc};
use git2::Repository;
use tracing::warn;

use crate::error::EntireResult;
use crate::id::CheckpointId;
use crate::paths::RepoPaths;
use crate::session::{SessionState, SessionStore};
use crate::store::{MetadataStore, SessionContent};

/// A checkpoint reachable as a restore target.
#[derive(Debug, Clone)]
pub struct RewindPoint {
    pub checkpoint_id: String,
    /// The latest user commit attributed to the checkpoint, if any.
    pub commit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Rewind points on the metadata branch, newest first.
pub fn rewind_points(
    repo: &Repository,
    paths: &RepoPaths,
    limit: usize,
) -> EntireResult<Vec<RewindPoint>> {
    let store = MetadataStore::new(repo, paths);
    let mut points = Vec::new();

    for summary in store.list_checkpoints()? {
        let Ok(id) = CheckpointId::parse(&summary.checkpoint_id) else {
            warn!(checkpoint = %summary.checkpoint_id, "skipping malformed checkpoint id");
            continue;
        };
        let timestamp = match store.read_session_content(&id, 0) {
            Ok(content) => content.metadata.updated_at,
            Err(e) => {
                warn!(checkpoint = %summary.checkpoint_id, error = %e, "skipping unreadable checkpoint");
                continue;
            }
        };
        points.push(RewindPoint {
            checkpoint_id: summary.checkpoint_id,
            commit: summary.commits.last().cloned(),
            timestamp,
        });
    }

    points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    points.truncate(limit);
    Ok(points)
}

/// One session entry's content for a checkpoint.
pub fn read_session_content(
    repo: &Repository,
    paths: &RepoPaths,
    id: &CheckpointId,
    session_index: usize,
) -> EntireResult<SessionContent> {
    MetadataStore::new(repo, paths).read_session_content(id, session_index)
}

/// All parseable session states.
pub fn list_sessions(paths: &RepoPaths) -> EntireResult<Vec<SessionState>> {
    SessionStore::new(&paths.metadata_dir).list_all()
}
