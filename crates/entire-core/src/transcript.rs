//! Agent transcript (JSONL) scanning.
//!
//! Transcripts are read-only to the engine. Each line is an independent
//! JSON object; lines that fail to parse are skipped. The engine extracts
//! two things: token usage totals and the set of files the agent's edit
//! tools touched.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use serde_json::Value;

use crate::checkpoint::TokenUsage;
use crate::error::EntireResult;

/// Tool names whose invocations modify files.
const EDIT_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Read a transcript file, returning empty bytes if it does not exist.
pub fn read_transcript(path: &Path) -> EntireResult<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Sum token usage across all assistant messages in a transcript.
pub fn scan_usage(transcript: &[u8]) -> TokenUsage {
    let mut total = TokenUsage::default();
    for line in transcript.split(|&b| b == b'\n') {
        let Ok(value) = serde_json::from_slice::<Value>(line) else {
            continue;
        };
        let usage = value
            .get("message")
            .and_then(|m| m.get("usage"))
            .or_else(|| value.get("usage"));
        let Some(usage) = usage else { continue };

        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
        total.add(&TokenUsage {
            input_tokens: field("input_tokens"),
            cache_creation_tokens: field("cache_creation_input_tokens"),
            cache_read_tokens: field("cache_read_input_tokens"),
            output_tokens: field("output_tokens"),
            api_call_count: 1,
        });
    }
    total
}

/// Collect the repo-relative paths touched by edit-tool invocations.
///
/// `repo_root` is used to relativize absolute `file_path` arguments; paths
/// outside the repository are skipped.
pub fn scan_files_touched(transcript: &[u8], repo_root: &Path) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    for line in transcript.split(|&b| b == b'\n') {
        let Ok(value) = serde_json::from_slice::<Value>(line) else {
            continue;
        };
        let Some(content) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        for block in content {
            if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                continue;
            }
            let Some(name) = block.get("name").and_then(Value::as_str) else {
                continue;
            };
            if !EDIT_TOOLS.contains(&name) {
                continue;
            }
            let Some(file_path) = block
                .get("input")
                .and_then(|i| i.get("file_path").or_else(|| i.get("notebook_path")))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if let Some(rel) = relativize(file_path, repo_root) {
                files.insert(rel);
            }
        }
    }
    files
}

fn relativize(file_path: &str, repo_root: &Path) -> Option<String> {
    let path = Path::new(file_path);
    if path.is_absolute() {
        let root = repo_root.canonicalize().unwrap_or_else(|_| repo_root.to_path_buf());
        path.strip_prefix(&root)
            .or_else(|_| path.strip_prefix(repo_root))
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    } else {
        Some(file_path.replace('\\', "/"))
    }
}
