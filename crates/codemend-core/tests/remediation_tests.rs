//! End-to-end remediation runs against local git fixtures, with a stub
//! lint tool on PATH and a recording host in place of the remote API.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use codemend_core::config::Config;
use codemend_core::error::{Error, Result};
use codemend_core::github::RepoHost;
use codemend_core::pipeline::Remediator;
use codemend_core::runner::Runner;
use codemend_core::store::ScheduleStore;
use codemend_core::types::{PullHead, RemediationEvent, RepoRef, RunOutcome};
use codemend_core::workspace::Workspace;
use serde_json::Value;
use tempfile::TempDir;

// ── Fixtures ──────────────────────────────────────────────────────────────

async fn git(dir: &Path, args: &[&str]) {
    Runner::new(60)
        .run("git", args, Some(dir), None)
        .await
        .unwrap();
}

async fn init_origin(root: &Path) -> PathBuf {
    let origin = root.join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init"]).await;
    git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]).await;
    git(&origin, &["config", "user.email", "bot@example.com"]).await;
    git(&origin, &["config", "user.name", "codemend"]).await;
    std::fs::write(origin.join("playbook.yml"), "- hosts: all\n  tasks: []\n").unwrap();
    git(&origin, &["add", "."]).await;
    git(&origin, &["commit", "-m", "initial", "--no-verify"]).await;
    origin
}

/// Drop a stub lint executable into its own bin dir and prepend that dir
/// to PATH so executable resolution finds it.
fn install_tool(root: &Path, name: &str, script: &str) {
    use std::os::unix::fs::PermissionsExt;

    let bin = root.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let tool = bin.join(name);
    std::fs::write(&tool, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let old = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{old}", bin.display()));
}

/// Commits inside pipeline workspaces pick the identity up from the
/// environment; the server normally configures it globally at startup.
fn set_git_identity_env() {
    for key in ["GIT_AUTHOR_NAME", "GIT_COMMITTER_NAME"] {
        std::env::set_var(key, "codemend");
    }
    for key in ["GIT_AUTHOR_EMAIL", "GIT_COMMITTER_EMAIL"] {
        std::env::set_var(key, "bot@example.com");
    }
}

fn test_config(base: &Path, lint_tool: &str, default_interval: &str) -> Arc<Config> {
    Arc::new(Config {
        github_token: "test-token".into(),
        webhook_secret: String::new(),
        api_base_url: "http://127.0.0.1:1".into(),
        base_clone_path: base.to_string_lossy().into_owned(),
        data_dir: "store".into(),
        web_bind: "127.0.0.1".into(),
        web_port: 0,
        sweep_interval_s: 3600,
        command_timeout_s: 60,
        lint_tool: lint_tool.into(),
        default_interval: default_interval.into(),
        settings_file: ".github/codemend.yml".into(),
        git_author_name: String::new(),
        git_author_email: String::new(),
    })
}

fn open_store(dir: &TempDir) -> Arc<ScheduleStore> {
    let path = dir.path().join("schedules.db");
    let store = ScheduleStore::open(path.to_str().unwrap()).unwrap();
    store.migrate().unwrap();
    Arc::new(store)
}

fn event() -> RemediationEvent {
    RemediationEvent {
        installation_id: 1,
        owner: "acme".into(),
        repo: "infra".into(),
        default_branch: "main".into(),
        dispatched_branch: None,
    }
}

// ── Recording host ────────────────────────────────────────────────────────

struct RecordingHost {
    origin: PathBuf,
    latest: String,
    parent_at_branch: Option<String>,
    pulls: Vec<PullHead>,
    created: Mutex<Vec<(String, String)>>,
}

impl RecordingHost {
    fn new(origin: &Path, latest: &str) -> Self {
        Self {
            origin: origin.to_path_buf(),
            latest: latest.to_string(),
            parent_at_branch: None,
            pulls: Vec::new(),
            created: Mutex::new(Vec::new()),
        }
    }

    fn created_pulls(&self) -> Vec<(String, String)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepoHost for RecordingHost {
    async fn latest_commit(&self, _: &str, _: &str, _: &str) -> Result<String> {
        Ok(self.latest.clone())
    }

    async fn branch_parent_commit(&self, _: &str, _: &str, _: &str) -> Result<Option<String>> {
        Ok(self.parent_at_branch.clone())
    }

    async fn list_open_pulls(&self, _: &str, _: &str) -> Result<Vec<PullHead>> {
        Ok(self.pulls.clone())
    }

    async fn create_pull(
        &self,
        _: &str,
        _: &str,
        _: &str,
        body: &str,
        head: &str,
        _: &str,
    ) -> Result<i64> {
        self.created
            .lock()
            .unwrap()
            .push((head.to_string(), body.to_string()));
        Ok(42)
    }

    async fn create_dispatch_event(&self, _: &str, _: &str, _: &str, _: Value) -> Result<()> {
        Err(Error::RemoteApi("not used in this test".into()))
    }

    async fn list_installation_repos(&self) -> Result<Vec<RepoRef>> {
        Err(Error::RemoteApi("not used in this test".into()))
    }

    async fn fetch_repo_settings(&self, _: &str, _: &str, _: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn clone_url(&self, _: &str, _: &str) -> String {
        self.origin.to_string_lossy().into_owned()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_with_fixes_opens_a_pull_request() {
    set_git_identity_env();
    let tmp = TempDir::new().unwrap();
    let origin = init_origin(tmp.path()).await;
    install_tool(
        tmp.path(),
        "mendfix-prop",
        "echo 'fixed 1 issue'\nprintf '# remediated\\n' >> playbook.yml",
    );

    let base = tmp.path().join("workspaces");
    let host = Arc::new(RecordingHost::new(&origin, "cafe0000"));
    let remediator = Remediator::new(
        host.clone(),
        open_store(&tmp),
        test_config(&base, "mendfix-prop", "daily"),
    );

    let outcome = remediator.run_manual(&event()).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Proposed {
            branch: "remediation/mendfix-prop/cafe0000".into(),
            pull_number: 42,
        }
    );

    // The report text is embedded in the PR body.
    let created = host.created_pulls();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, "remediation/mendfix-prop/cafe0000");
    assert!(created[0].1.contains("fixed 1 issue"));

    // Branch pushed to the remote; workspace gone.
    git(
        &origin,
        &[
            "show-ref",
            "--verify",
            "refs/heads/remediation/mendfix-prop/cafe0000",
        ],
    )
    .await;
    assert!(!Workspace::path_for(&base, "acme", "infra", "cafe0000").exists());
}

#[tokio::test]
async fn test_clean_run_is_a_no_op() {
    set_git_identity_env();
    let tmp = TempDir::new().unwrap();
    let origin = init_origin(tmp.path()).await;
    install_tool(tmp.path(), "noopmend", "exit 0");

    let base = tmp.path().join("workspaces");
    let host = Arc::new(RecordingHost::new(&origin, "cafe0000"));
    let remediator = Remediator::new(
        host.clone(),
        open_store(&tmp),
        test_config(&base, "noopmend", "daily"),
    );

    let outcome = remediator.run_manual(&event()).await.unwrap();
    assert_eq!(outcome, RunOutcome::NoChanges);
    assert!(host.created_pulls().is_empty());
    assert!(!Workspace::path_for(&base, "acme", "infra", "cafe0000").exists());
}

#[tokio::test]
async fn test_matching_open_proposal_is_not_duplicated() {
    set_git_identity_env();
    let tmp = TempDir::new().unwrap();
    let origin = init_origin(tmp.path()).await;
    install_tool(
        tmp.path(),
        "mendfix-dup",
        "printf '# remediated\\n' >> playbook.yml",
    );

    // An open proposal branch already carries exactly the fix the tool
    // will produce again.
    git(&origin, &["checkout", "-b", "remediation/mendfix-dup/old1"]).await;
    std::fs::write(
        origin.join("playbook.yml"),
        "- hosts: all\n  tasks: []\n# remediated\n",
    )
    .unwrap();
    git(&origin, &["add", "."]).await;
    git(&origin, &["commit", "-m", "Fix lint rule violations", "--no-verify"]).await;
    git(&origin, &["checkout", "main"]).await;

    let base = tmp.path().join("workspaces");
    let mut host = RecordingHost::new(&origin, "cafe0000");
    host.pulls = vec![PullHead {
        number: 7,
        head_label: "acme:remediation/mendfix-dup/old1".into(),
        head_ref: "remediation/mendfix-dup/old1".into(),
    }];
    let host = Arc::new(host);
    let remediator = Remediator::new(
        host.clone(),
        open_store(&tmp),
        test_config(&base, "mendfix-dup", "daily"),
    );

    let outcome = remediator.run_manual(&event()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Duplicate);
    assert!(host.created_pulls().is_empty());
    assert!(!Workspace::path_for(&base, "acme", "infra", "cafe0000").exists());

    // No new remediation branch reached the remote.
    let pushed = Runner::new(60)
        .run(
            "git",
            &[
                "show-ref",
                "--verify",
                "refs/heads/remediation/mendfix-dup/cafe0000",
            ],
            Some(&origin),
            None,
        )
        .await;
    assert!(pushed.is_err());
}

#[tokio::test]
async fn test_branch_already_at_latest_commit_skips_the_run() {
    set_git_identity_env();
    let tmp = TempDir::new().unwrap();
    let origin = init_origin(tmp.path()).await;

    let base = tmp.path().join("workspaces");
    let mut host = RecordingHost::new(&origin, "cafe0000");
    host.parent_at_branch = Some("cafe0000".into());
    let host = Arc::new(host);
    let remediator = Remediator::new(
        host,
        open_store(&tmp),
        test_config(&base, "noopmend", "daily"),
    );

    let outcome = remediator.run_manual(&event()).await.unwrap();
    assert_eq!(outcome, RunOutcome::AlreadyProposed);
    // The run stopped before cloning anything.
    assert!(!Workspace::path_for(&base, "acme", "infra", "cafe0000").exists());
}

#[tokio::test]
async fn test_unresolvable_tool_aborts_with_cleanup() {
    set_git_identity_env();
    let tmp = TempDir::new().unwrap();
    let origin = init_origin(tmp.path()).await;

    let base = tmp.path().join("workspaces");
    let host = Arc::new(RecordingHost::new(&origin, "cafe0000"));
    let remediator = Remediator::new(
        host,
        open_store(&tmp),
        test_config(&base, "definitely-missing-tool-91", "daily"),
    );

    let err = remediator.run_manual(&event()).await.unwrap_err();
    assert!(matches!(err, Error::ToolUnavailable(_)));
    // The clone had already happened; it must still be cleaned up.
    assert!(!Workspace::path_for(&base, "acme", "infra", "cafe0000").exists());
}

#[tokio::test]
async fn test_dispatch_event_creates_then_refreshes_the_schedule() {
    set_git_identity_env();
    let tmp = TempDir::new().unwrap();
    let origin = init_origin(tmp.path()).await;
    install_tool(tmp.path(), "noopmend-sched", "exit 0");

    let base = tmp.path().join("workspaces");
    let store = open_store(&tmp);
    let host = Arc::new(RecordingHost::new(&origin, "cafe0000"));
    let remediator = Remediator::new(
        host,
        Arc::clone(&store),
        test_config(&base, "noopmend-sched", "weekly"),
    );

    // First event: record created with the default interval.
    remediator.handle_event(&event()).await.unwrap();
    let record = store.get_schedule("acme", "infra").unwrap().unwrap();
    assert_eq!(record.interval.as_str(), "weekly");

    // Age the record, then deliver another event: only the timestamp moves.
    let mut aged = record.clone();
    aged.last_dispatched_at = "2023-10-05T08:00:00Z".parse().unwrap();
    store.update_last_dispatched(&aged).unwrap();

    let before = Utc::now();
    remediator.handle_event(&event()).await.unwrap();
    let refreshed = store.get_schedule("acme", "infra").unwrap().unwrap();
    assert!(refreshed.last_dispatched_at >= before - chrono::Duration::seconds(5));
    assert_eq!(refreshed.interval.as_str(), "weekly");
}

#[tokio::test]
async fn test_unsupported_default_interval_fails_before_any_side_effect() {
    set_git_identity_env();
    let tmp = TempDir::new().unwrap();
    let origin = init_origin(tmp.path()).await;

    let base = tmp.path().join("workspaces");
    let store = open_store(&tmp);
    let host = Arc::new(RecordingHost::new(&origin, "cafe0000"));
    let remediator = Remediator::new(
        host,
        Arc::clone(&store),
        test_config(&base, "noopmend", "bi-weekly"),
    );

    let err = remediator.handle_event(&event()).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedInterval(_)));
    assert!(store.get_schedule("acme", "infra").unwrap().is_none());
    assert!(!Workspace::path_for(&base, "acme", "infra", "cafe0000").exists());
}
