//! Pre-persist artifact filtering.
//!
//! Before any write that would include transcript content reaches the
//! metadata branch, the artifact passes through a filter. The secret
//! scanner plugs in here; the engine itself ships a pass-through.

/// The artifact bundle submitted for filtering.
#[derive(Debug, Clone, Default)]
pub struct Artifact {
    pub transcript: Vec<u8>,
    pub prompts: Vec<String>,
    pub context: Vec<u8>,
}

/// Result of filtering an artifact.
pub enum Filtered {
    /// Persist this (possibly rewritten) artifact.
    Pass(Artifact),
    /// Do not persist; the reason is reported to the caller.
    Reject { reason: String },
}

/// A pre-persist filter over checkpoint artifacts.
pub trait ArtifactFilter {
    fn filter(&self, artifact: Artifact) -> Filtered;
}

/// The default filter: everything passes unchanged.
pub struct NoopFilter;

impl ArtifactFilter for NoopFilter {
    fn filter(&self, artifact: Artifact) -> Filtered {
        Filtered::Pass(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectAll;

    impl ArtifactFilter for RejectAll {
        fn filter(&self, _artifact: Artifact) -> Filtered {
            Filtered::Reject {
                reason: "policy".to_string(),
            }
        }
    }

    #[test]
    fn test_noop_passes_unchanged() {
        let artifact = Artifact {
            transcript: b"t".to_vec(),
            prompts: vec!["p".to_string()],
            context: b"c".to_vec(),
        };
        match NoopFilter.filter(artifact) {
            Filtered::Pass(a) => {
                assert_eq!(a.transcript, b"t");
                assert_eq!(a.prompts, vec!["p".to_string()]);
            }
            Filtered::Reject { .. } => panic!("noop filter rejected"),
        }
    }

    #[test]
    fn test_reject_carries_reason() {
        match RejectAll.filter(Artifact::default()) {
            Filtered::Reject { reason } => assert_eq!(reason, "policy"),
            Filtered::Pass(_) => panic!("expected rejection"),
        }
    }
}
