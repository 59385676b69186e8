use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use codemend_core::dispatch::DispatchSweeper;
use codemend_core::error::{Error, Result};
use codemend_core::github::RepoHost;
use codemend_core::schedule::Interval;
use codemend_core::store::ScheduleStore;
use codemend_core::types::{PullHead, RepoRef, ScheduleRecord};
use serde_json::Value;
use tempfile::TempDir;

// ── Mock host ─────────────────────────────────────────────────────────────

struct MockHost {
    repos: Vec<RepoRef>,
    list_fails: bool,
    dispatched: Mutex<Vec<String>>,
}

impl MockHost {
    fn new(repos: Vec<RepoRef>) -> Self {
        Self {
            repos,
            list_fails: false,
            dispatched: Mutex::new(Vec::new()),
        }
    }

    fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepoHost for MockHost {
    async fn latest_commit(&self, _: &str, _: &str, _: &str) -> Result<String> {
        Err(Error::RemoteApi("not used in this test".into()))
    }

    async fn branch_parent_commit(&self, _: &str, _: &str, _: &str) -> Result<Option<String>> {
        Err(Error::RemoteApi("not used in this test".into()))
    }

    async fn list_open_pulls(&self, _: &str, _: &str) -> Result<Vec<PullHead>> {
        Err(Error::RemoteApi("not used in this test".into()))
    }

    async fn create_pull(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<i64> {
        Err(Error::RemoteApi("not used in this test".into()))
    }

    async fn create_dispatch_event(
        &self,
        owner: &str,
        repo: &str,
        _event_type: &str,
        _client_payload: Value,
    ) -> Result<()> {
        self.dispatched
            .lock()
            .unwrap()
            .push(format!("{owner}/{repo}"));
        Ok(())
    }

    async fn list_installation_repos(&self) -> Result<Vec<RepoRef>> {
        if self.list_fails {
            return Err(Error::RemoteApi("repository listing unavailable".into()));
        }
        Ok(self.repos.clone())
    }

    async fn fetch_repo_settings(&self, _: &str, _: &str, _: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn clone_url(&self, owner: &str, repo: &str) -> String {
        format!("https://example.invalid/{owner}/{repo}.git")
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn repo(owner: &str, name: &str) -> RepoRef {
    RepoRef {
        owner: owner.to_string(),
        repo: name.to_string(),
        default_branch: "main".to_string(),
    }
}

fn open_store(dir: &TempDir) -> Arc<ScheduleStore> {
    let path = dir.path().join("schedules.db");
    let store = ScheduleStore::open(path.to_str().unwrap()).unwrap();
    store.migrate().unwrap();
    Arc::new(store)
}

fn seed(store: &ScheduleStore, owner: &str, name: &str, interval: Interval, last: &str) {
    store
        .store_schedule(&ScheduleRecord {
            owner: owner.to_string(),
            repo: name.to_string(),
            interval,
            last_dispatched_at: last.parse().unwrap(),
        })
        .unwrap();
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unseen_repository_is_always_dispatched() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let host = Arc::new(MockHost::new(vec![repo("acme", "infra")]));
    let sweeper = DispatchSweeper::new(host.clone(), store);

    let stats = sweeper.run_sweep().await.unwrap();
    assert_eq!(stats.evaluated, 1);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(host.dispatched(), ["acme/infra"]);
}

#[tokio::test]
async fn test_due_repository_dispatched_and_fresh_one_skipped() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    // Dispatched before 09:00 on a long-past day: due instant has passed.
    seed(&store, "acme", "stale", Interval::Daily, "2023-10-05T08:00:00Z");
    // Dispatched just now: the derived due instant cannot be both passed
    // and after the anchor, whatever the current time of day.
    let now = chrono::Utc::now().to_rfc3339();
    seed(&store, "acme", "fresh", Interval::Daily, &now);

    let host = Arc::new(MockHost::new(vec![
        repo("acme", "stale"),
        repo("acme", "fresh"),
    ]));
    let sweeper = DispatchSweeper::new(host.clone(), store);

    let stats = sweeper.run_sweep().await.unwrap();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(host.dispatched(), ["acme/stale"]);
}

#[tokio::test]
async fn test_sweep_isolates_per_repository_failures() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    // Corrupt the middle repository's record so its lookup fails.
    {
        let db_path = dir.path().join("schedules.db");
        let conn = rusqlite::Connection::open(db_path.to_str().unwrap()).unwrap();
        conn.execute(
            "INSERT INTO schedules (owner, repo, interval, last_dispatched_at) \
             VALUES ('acme', 'broken', 'bi-weekly', '2023-10-05T08:00:00Z')",
            [],
        )
        .unwrap();
    }

    let host = Arc::new(MockHost::new(vec![
        repo("acme", "first"),
        repo("acme", "broken"),
        repo("acme", "last"),
    ]));
    let sweeper = DispatchSweeper::new(host.clone(), store);

    let stats = sweeper.run_sweep().await.unwrap();
    assert_eq!(stats.evaluated, 3);
    assert_eq!(stats.failed, 1);
    // Repositories after the failing one are still evaluated.
    assert_eq!(host.dispatched(), ["acme/first", "acme/last"]);
}

#[tokio::test]
async fn test_sweep_level_failure_propagates() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let host = Arc::new(MockHost {
        repos: Vec::new(),
        list_fails: true,
        dispatched: Mutex::new(Vec::new()),
    });
    let sweeper = DispatchSweeper::new(host, store);

    assert!(sweeper.run_sweep().await.is_err());
}
