//! End-to-end lifecycle scenarios, driven through the hook dispatcher the
//! way real hook processes drive the engine: a fresh `Dispatcher` per
//! event, JSON payloads, and a real git repository underneath.

use entire_core::checkpoint::StrategyKind;
use entire_core::hook::{HookEvent, HookInput};
use entire_core::id::CheckpointId;
use entire_core::paths::{shadow_branch_name, RepoPaths};
use entire_core::query;
use entire_core::session::SessionStore;
use entire_core::store::MetadataStore;
use entire_core::Dispatcher;

use git2::{Oid, Repository, Signature};
use tempfile::TempDir;

struct TestEnv {
    dir: TempDir,
    initial_commit: Oid,
}

impl TestEnv {
    /// A repository with one commit, the given strategy configured, and
    /// (optionally) a feature branch checked out.
    fn new(strategy: &str, feature_branch: Option<&str>) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(std::path::Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_oid = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        let sig = Signature::now("Test", "test@test.com").unwrap();
        let initial_commit = repo
            .commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        repo.config().unwrap().set_str("entire.strategy", strategy).unwrap();
        repo.config().unwrap().set_str("user.name", "Test").unwrap();
        repo.config()
            .unwrap()
            .set_str("user.email", "test@test.com")
            .unwrap();

        if let Some(name) = feature_branch {
            let commit = repo.find_commit(initial_commit).unwrap();
            repo.branch(name, &commit, false).unwrap();
            repo.set_head(&format!("refs/heads/{name}")).unwrap();
        }

        TestEnv {
            dir,
            initial_commit,
        }
    }

    fn repo(&self) -> Repository {
        Repository::open(self.dir.path()).unwrap()
    }

    fn paths(&self) -> RepoPaths {
        RepoPaths::discover(self.dir.path()).unwrap()
    }

    fn dispatch(&self, event: HookEvent, payload: serde_json::Value) {
        let input: HookInput = serde_json::from_value(payload).unwrap();
        let dispatcher = Dispatcher::discover(self.dir.path()).unwrap();
        dispatcher.dispatch(event, &input).unwrap();
    }

    /// Write files into the worktree and produce a transcript whose edit
    /// tool calls reference them.
    fn transcript(&self, name: &str, prompt: &str, files: &[(&str, &str)]) -> String {
        for (path, content) in files {
            std::fs::write(self.dir.path().join(path), content).unwrap();
        }
        let tool_uses: Vec<serde_json::Value> = files
            .iter()
            .map(|(path, _)| {
                serde_json::json!({
                    "type": "tool_use",
                    "name": "Write",
                    "input": {"file_path": self.dir.path().join(path).to_string_lossy()}
                })
            })
            .collect();
        let lines = [
            serde_json::json!({
                "type": "user",
                "message": {"content": [{"type": "text", "text": prompt}]}
            })
            .to_string(),
            serde_json::json!({
                "type": "assistant",
                "message": {
                    "usage": {"input_tokens": 100, "output_tokens": 10},
                    "content": tool_uses
                }
            })
            .to_string(),
        ];
        let path = self.dir.path().join(format!("{name}.jsonl"));
        std::fs::write(&path, lines.join("\n")).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn run_turn(&self, session: &str, prompt: &str, files: &[(&str, &str)]) {
        self.dispatch(
            HookEvent::UserPromptSubmit,
            serde_json::json!({"session_id": session, "prompt": prompt}),
        );
        let transcript = self.transcript(&format!("{session}-turn"), prompt, files);
        self.dispatch(
            HookEvent::Stop,
            serde_json::json!({"session_id": session, "transcript_path": transcript}),
        );
    }

    fn rewind_points(&self) -> Vec<query::RewindPoint> {
        let repo = self.repo();
        let paths = self.paths();
        query::rewind_points(&repo, &paths, 100).unwrap()
    }

    fn commit_paths(&self, message: &str, paths: &[&str]) -> Oid {
        let repo = self.repo();
        let mut index = repo.index().unwrap();
        for path in paths {
            index.add_path(std::path::Path::new(path)).unwrap();
        }
        index.write().unwrap();
        let tree_oid = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        let sig = Signature::now("Test", "test@test.com").unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .unwrap();
        self.dispatch(HookEvent::PostCommit, serde_json::json!({}));
        oid
    }
}

#[test]
fn fresh_manual_commit_turn_on_feature_branch() {
    let env = TestEnv::new("manual-commit", Some("feature/test-branch"));
    env.run_turn("s1", "Add a file", &[("file.txt", "content on feature branch")]);

    let points = env.rewind_points();
    assert_eq!(points.len(), 1);

    let repo = env.repo();
    let paths = env.paths();
    let store = MetadataStore::new(&repo, &paths);
    let id = CheckpointId::parse(&points[0].checkpoint_id).unwrap();

    let summary = store.read_committed(&id).unwrap();
    assert_eq!(summary.strategy, StrategyKind::ManualCommit);
    assert_eq!(summary.branch, "feature/test-branch");
    assert_eq!(summary.files_touched, vec!["file.txt".to_string()]);

    let content = store.read_session_content(&id, 0).unwrap();
    assert_eq!(content.metadata.session_id, "s1");

    // The shadow branch for the base commit exists in this worktree.
    let shadow_name = shadow_branch_name(&env.initial_commit.to_string(), &paths.worktree_id);
    assert!(repo
        .find_branch(&shadow_name, git2::BranchType::Local)
        .is_ok());
}

#[test]
fn auto_commit_suppressed_on_default_branch() {
    let env = TestEnv::new("auto-commit", None);
    env.run_turn("s1", "Add a file", &[("file.txt", "content on main")]);

    assert_eq!(env.rewind_points().len(), 0);

    // No checkpoint persisted, no shadow branch created.
    let repo = env.repo();
    let paths = env.paths();
    let store = MetadataStore::new(&repo, &paths);
    assert!(store.list_checkpoints().unwrap().is_empty());
    let shadow_name = shadow_branch_name(&env.initial_commit.to_string(), &paths.worktree_id);
    assert!(repo
        .find_branch(&shadow_name, git2::BranchType::Local)
        .is_err());
}

#[test]
fn subagent_task_under_manual_commit() {
    let env = TestEnv::new("manual-commit", Some("feature/test-branch"));

    env.dispatch(
        HookEvent::UserPromptSubmit,
        serde_json::json!({"session_id": "s1", "prompt": "Create a file using a subagent"}),
    );
    env.dispatch(
        HookEvent::PreTask,
        serde_json::json!({"session_id": "s1", "tool_use_id": "toolu_t1"}),
    );
    let transcript = env.transcript("s1-task", "Create task.txt", &[("task.txt", "from task")]);
    env.dispatch(
        HookEvent::PostTask,
        serde_json::json!({
            "session_id": "s1",
            "tool_use_id": "toolu_t1",
            "agent_id": "a1",
            "transcript_path": transcript
        }),
    );
    env.dispatch(
        HookEvent::Stop,
        serde_json::json!({"session_id": "s1", "transcript_path": transcript}),
    );

    let points = env.rewind_points();
    assert_eq!(points.len(), 2);

    let repo = env.repo();
    let paths = env.paths();
    let store = MetadataStore::new(&repo, &paths);

    let mut agents = Vec::new();
    let mut parent_has_task_file = false;
    for point in &points {
        let id = CheckpointId::parse(&point.checkpoint_id).unwrap();
        let content = store.read_session_content(&id, 0).unwrap();
        agents.push(content.metadata.agents.clone());
        let summary = store.read_committed(&id).unwrap();
        if content.metadata.agents.is_empty()
            && summary.files_touched.contains(&"task.txt".to_string())
        {
            parent_has_task_file = true;
        }
    }
    // One checkpoint is the nested task stamped with the subagent identity.
    assert!(agents.contains(&"a1".to_string()));
    // The parent turn aggregated the task's files.
    assert!(parent_has_task_file);
}

#[test]
fn second_session_joins_existing_checkpoint() {
    let env = TestEnv::new("manual-commit", Some("feature/test-branch"));

    env.dispatch(
        HookEvent::UserPromptSubmit,
        serde_json::json!({"session_id": "s1", "prompt": "Add a file"}),
    );
    // s2 prompts inside s1's turn window: same worktree, same base commit.
    env.dispatch(
        HookEvent::UserPromptSubmit,
        serde_json::json!({"session_id": "s2", "prompt": "Help out"}),
    );

    let t1 = env.transcript("s1-turn", "Add a file", &[("file.txt", "content")]);
    env.dispatch(
        HookEvent::Stop,
        serde_json::json!({"session_id": "s1", "transcript_path": t1}),
    );

    let repo = env.repo();
    let paths = env.paths();
    let store = MetadataStore::new(&repo, &paths);
    let points = env.rewind_points();
    assert_eq!(points.len(), 1);
    let id = CheckpointId::parse(&points[0].checkpoint_id).unwrap();
    let first_entry_before = store.read_session_content(&id, 0).unwrap();

    let t2 = env.transcript("s2-turn", "Help out", &[("other.txt", "more content")]);
    env.dispatch(
        HookEvent::Stop,
        serde_json::json!({"session_id": "s2", "transcript_path": t2}),
    );

    // The checkpoint grew a second numbered entry; no new checkpoint.
    assert_eq!(env.rewind_points().len(), 1);
    let summary = store.read_committed(&id).unwrap();
    assert_eq!(summary.sessions.len(), 2);

    let second = store.read_session_content(&id, 1).unwrap();
    assert_eq!(second.metadata.session_id, "s2");

    // Root token usage is the element-wise sum of both entries.
    let first = store.read_session_content(&id, 0).unwrap();
    assert_eq!(
        summary.token_usage.input_tokens,
        first.metadata.token_usage.input_tokens + second.metadata.token_usage.input_tokens
    );
    assert_eq!(summary.token_usage.api_call_count, 2);

    // Index 0 is unchanged by the join.
    assert_eq!(first.metadata.session_id, first_entry_before.metadata.session_id);
    assert_eq!(first.transcript, first_entry_before.transcript);
    assert_eq!(first.prompts, first_entry_before.prompts);
}

#[test]
fn amended_commit_replaces_association() {
    let env = TestEnv::new("manual-commit", Some("feature/test-branch"));
    env.run_turn("s1", "Add a file", &[("file.txt", "agent content")]);

    let original = env.commit_paths("original message", &["file.txt"]);

    let repo = env.repo();
    let paths = env.paths();
    let store = MetadataStore::new(&repo, &paths);
    let points = env.rewind_points();
    let id = CheckpointId::parse(&points[0].checkpoint_id).unwrap();
    assert!(store
        .read_committed(&id)
        .unwrap()
        .commits
        .contains(&original.to_string()));

    // Amend the message only; the tree is unchanged.
    let amended = {
        let original_commit = repo.find_commit(original).unwrap();
        original_commit
            .amend(Some("HEAD"), None, None, None, Some("amended message"), None)
            .unwrap()
    };
    env.dispatch(HookEvent::PostCommit, serde_json::json!({}));

    let commits = store.read_committed(&id).unwrap().commits;
    assert!(!commits.contains(&original.to_string()));
    assert!(commits.contains(&amended.to_string()));

    // The shadow branch follows the amended commit name.
    let old_shadow = shadow_branch_name(&original.to_string(), &paths.worktree_id);
    let new_shadow = shadow_branch_name(&amended.to_string(), &paths.worktree_id);
    assert!(repo.find_branch(&old_shadow, git2::BranchType::Local).is_err());
    assert!(repo.find_branch(&new_shadow, git2::BranchType::Local).is_ok());
}

#[test]
fn partial_staging_carries_forward() {
    let env = TestEnv::new("manual-commit", Some("feature/test-branch"));
    env.run_turn(
        "s1",
        "Write two files",
        &[("a.txt", "content a"), ("b.txt", "content b")],
    );

    let first = env.commit_paths("only a", &["a.txt"]);

    let repo = env.repo();
    let paths = env.paths();
    let store = MetadataStore::new(&repo, &paths);
    let id = CheckpointId::parse(&env.rewind_points()[0].checkpoint_id).unwrap();
    assert!(store
        .read_committed(&id)
        .unwrap()
        .commits
        .contains(&first.to_string()));

    // b.txt is marked carry-forward in the session state.
    let sessions = SessionStore::new(&paths.metadata_dir);
    let state = sessions.load("s1").unwrap().unwrap();
    let carried: Vec<&String> = state.turn_records[0].carried_forward().collect();
    assert_eq!(carried, vec![&"b.txt".to_string()]);

    // The follow-up commit of b.txt attributes to the same checkpoint.
    let second = env.commit_paths("now b", &["b.txt"]);
    let summary = store.read_committed(&id).unwrap();
    assert!(summary.commits.contains(&first.to_string()));
    assert!(summary.commits.contains(&second.to_string()));

    // No duplicate files_touched entries.
    assert_eq!(
        summary
            .files_touched
            .iter()
            .filter(|f| f.as_str() == "b.txt")
            .count(),
        1
    );
}

#[test]
fn auto_commit_turn_on_feature_branch_produces_commit_and_attribution() {
    let env = TestEnv::new("auto-commit", Some("feature/test-branch"));
    env.run_turn("s1", "Add a file", &[("file.txt", "auto content")]);

    // A commit was produced at turn end and attributed to the checkpoint.
    let repo = env.repo();
    let head = repo.head().unwrap().target().unwrap();
    assert_ne!(head, env.initial_commit);

    let points = env.rewind_points();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].commit.as_deref(), Some(head.to_string().as_str()));

    // No shadow branches under auto-commit.
    let paths = env.paths();
    let shadow_name = shadow_branch_name(&head.to_string(), &paths.worktree_id);
    assert!(repo.find_branch(&shadow_name, git2::BranchType::Local).is_err());
}

#[test]
fn pre_push_is_read_only() {
    let env = TestEnv::new("manual-commit", Some("feature/test-branch"));
    env.run_turn("s1", "Add a file", &[("file.txt", "content")]);

    let paths = env.paths();
    let sessions = SessionStore::new(&paths.metadata_dir);
    let before = serde_json::to_string(&sessions.load("s1").unwrap().unwrap()).unwrap();

    env.dispatch(HookEvent::PrePush, serde_json::json!({}));

    let after = serde_json::to_string(&sessions.load("s1").unwrap().unwrap()).unwrap();
    assert_eq!(before, after);
}
