//! Checkpoint identifiers and content hashes.
//!
//! A `CheckpointId` is 12 lowercase hex characters, minted by hashing
//! `{timestamp_ns, session_id, base_commit, sequence}` and truncating.
//! A content hash is `sha256:` followed by the hex digest of a canonical
//! encoding of a session entry's payload; it is regenerated on every
//! update, and a mismatch against the stored file signals corruption.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::{EntireError, EntireResult};

/// Prefix marking a content hash value.
pub const CONTENT_HASH_PREFIX: &str = "sha256:";

/// A 12-lowercase-hex checkpoint identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Mint a new content-derived ID.
    pub fn mint(timestamp_ns: u128, session_id: &str, base_commit: &str, sequence: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(timestamp_ns.to_le_bytes());
        hasher.update(session_id.as_bytes());
        hasher.update(base_commit.as_bytes());
        hasher.update(sequence.to_le_bytes());
        let digest = hasher.finalize();
        let hex: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
        CheckpointId(hex)
    }

    /// Parse and validate an ID string.
    pub fn parse(s: &str) -> EntireResult<Self> {
        let valid = s.len() == 12
            && s.chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !valid {
            return Err(EntireError::InvalidCheckpointId(s.to_string()));
        }
        Ok(CheckpointId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sharded path of this checkpoint on the metadata branch: the first
    /// byte becomes a directory level, bounding listing costs.
    pub fn tree_path(&self) -> String {
        format!("{}/{}", &self.0[..2], &self.0[2..])
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CheckpointId {
    type Err = EntireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckpointId::parse(s)
    }
}

/// Compute the content hash of a session entry's payload.
///
/// Takes the artifact bytes exactly as stored on the metadata branch
/// (`full.jsonl`, `prompt.txt`, `context.md`) plus the sorted file set, so
/// a stored hash can always be re-verified from the stored artifacts. The
/// canonicalization is length-prefixed so adjacent fields can never be
/// confused for one another.
pub fn content_hash(
    transcript: &[u8],
    prompts: &[u8],
    context: &[u8],
    files_touched: &[String],
) -> String {
    let mut hasher = Sha256::new();

    let mut update = |part: &[u8]| {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    };

    update(transcript);
    update(prompts);
    update(context);

    let mut sorted: Vec<&String> = files_touched.iter().collect();
    sorted.sort();
    update(&(sorted.len() as u64).to_le_bytes());
    for f in sorted {
        update(f.as_bytes());
    }

    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{CONTENT_HASH_PREFIX}{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_shape() {
        let id = CheckpointId::mint(123_456_789, "sess-1", "abc123", 0);
        assert_eq!(id.as_str().len(), 12);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_mint_varies_by_sequence() {
        let a = CheckpointId::mint(1, "s", "c", 0);
        let b = CheckpointId::mint(1, "s", "c", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_mint_deterministic() {
        let a = CheckpointId::mint(42, "s", "c", 7);
        let b = CheckpointId::mint(42, "s", "c", 7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_accepts_valid() {
        let id = CheckpointId::parse("a1b2c3d4e5f6").unwrap();
        assert_eq!(id.as_str(), "a1b2c3d4e5f6");
    }

    #[test]
    fn test_parse_rejects_uppercase() {
        assert!(CheckpointId::parse("A1B2C3D4E5F6").is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(CheckpointId::parse("a1b2c3").is_err());
        assert!(CheckpointId::parse("a1b2c3d4e5f6a1").is_err());
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert!(CheckpointId::parse("g1b2c3d4e5f6").is_err());
    }

    #[test]
    fn test_tree_path_sharding() {
        let id = CheckpointId::parse("a1b2c3d4e5f6").unwrap();
        assert_eq!(id.tree_path(), "a1/b2c3d4e5f6");
    }

    #[test]
    fn test_content_hash_prefix_and_determinism() {
        let files = vec!["a.txt".to_string(), "b.txt".to_string()];
        let h1 = content_hash(b"t", b"p", b"c", &files);
        let h2 = content_hash(b"t", b"p", b"c", &files);
        assert_eq!(h1, h2);
        assert!(h1.starts_with(CONTENT_HASH_PREFIX));
        assert_eq!(h1.len(), CONTENT_HASH_PREFIX.len() + 64);
    }

    #[test]
    fn test_content_hash_file_order_irrelevant() {
        let ab = vec!["a.txt".to_string(), "b.txt".to_string()];
        let ba = vec!["b.txt".to_string(), "a.txt".to_string()];
        assert_eq!(content_hash(b"t", b"", b"c", &ab), content_hash(b"t", b"", b"c", &ba));
    }

    #[test]
    fn test_content_hash_sensitive_to_each_part() {
        let base = content_hash(b"t", b"p", b"c", &["f".into()]);
        assert_ne!(base, content_hash(b"T", b"p", b"c", &["f".into()]));
        assert_ne!(base, content_hash(b"t", b"P", b"c", &["f".into()]));
        assert_ne!(base, content_hash(b"t", b"p", b"C", &["f".into()]));
        assert_ne!(base, content_hash(b"t", b"p", b"c", &["F".into()]));
    }

    #[test]
    fn test_content_hash_field_boundaries() {
        // "ab" + "c" must differ from "a" + "bc" across a field boundary.
        let h1 = content_hash(b"ab", b"c", b"", &[]);
        let h2 = content_hash(b"a", b"bc", b"", &[]);
        assert_ne!(h1, h2);
    }
}
