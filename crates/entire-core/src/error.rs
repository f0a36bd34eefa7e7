//! Error types for the checkpoint engine.

use std::fmt;
use std::io;

/// All possible engine errors.
#[derive(Debug)]
pub enum EntireError {
    /// No enclosing git directory was found.
    NotARepository,
    /// Misconfiguration: unknown strategy, malformed state, unsupported operation.
    Config(String),
    /// Lock contention past the acquisition timeout. Retryable by the caller.
    Busy(String),
    /// A checkpoint, session, or ref was absent where one was expected.
    NotFound(String),
    /// A checkpoint path is already occupied on the metadata branch.
    AlreadyExists(String),
    /// A checkpoint ID failed the 12-lowercase-hex shape check.
    InvalidCheckpointId(String),
    /// A session ID contains characters unsafe for use as a filename.
    InvalidSessionId(String),
    /// Content hash mismatch or unparseable metadata. Per-record, never fatal.
    Corruption(String),
    /// An underlying git object or ref write failed.
    Git(git2::Error),
    /// An operation was interrupted mid-flight.
    Cancelled,
    /// An I/O error occurred.
    Io(io::Error),
    /// JSON serialization/deserialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for EntireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntireError::NotARepository => write!(f, "not a git repository"),
            EntireError::Config(msg) => write!(f, "configuration error: {msg}"),
            EntireError::Busy(what) => write!(f, "busy: could not acquire {what} within timeout"),
            EntireError::NotFound(what) => write!(f, "not found: {what}"),
            EntireError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EntireError::InvalidCheckpointId(id) => {
                write!(f, "invalid checkpoint ID: {id:?} (want 12 lowercase hex characters)")
            }
            EntireError::InvalidSessionId(id) => write!(f, "invalid session ID: {id:?}"),
            EntireError::Corruption(msg) => write!(f, "corrupt record: {msg}"),
            EntireError::Git(e) => write!(f, "git error: {e}"),
            EntireError::Cancelled => write!(f, "operation cancelled"),
            EntireError::Io(e) => write!(f, "I/O error: {e}"),
            EntireError::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for EntireError {}

impl From<io::Error> for EntireError {
    fn from(e: io::Error) -> Self {
        EntireError::Io(e)
    }
}

impl From<serde_json::Error> for EntireError {
    fn from(e: serde_json::Error) -> Self {
        EntireError::Json(e)
    }
}

impl From<git2::Error> for EntireError {
    fn from(e: git2::Error) -> Self {
        EntireError::Git(e)
    }
}

/// Convenience alias for Results in the engine.
pub type EntireResult<T> = Result<T, EntireError>;

impl EntireError {
    /// Whether the engine can recover locally from this error
    /// (log and skip the record, or report and retry later).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EntireError::Busy(_) | EntireError::Corruption(_) | EntireError::NotFound(_)
        )
    }
}
