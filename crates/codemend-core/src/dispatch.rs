use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::error::Result;
use crate::github::RepoHost;
use crate::schedule::ScheduleEvaluation;
use crate::store::ScheduleStore;
use crate::types::{RepoRef, SweepStats};

/// Event type attached to every remote dispatch signal.
pub const DISPATCH_EVENT_TYPE: &str = "codemend scan";

/// Iterates every repository visible to the installation and fires a
/// dispatch event for each one that is due (or never seen before).
pub struct DispatchSweeper {
    host: Arc<dyn RepoHost>,
    store: Arc<ScheduleStore>,
}

impl DispatchSweeper {
    pub fn new(host: Arc<dyn RepoHost>, store: Arc<ScheduleStore>) -> Self {
        Self { host, store }
    }

    /// One pass over all visible repositories.
    ///
    /// A failure to enumerate repositories aborts the sweep. A failure for
    /// one repository is logged and never blocks the others.
    pub async fn run_sweep(&self) -> Result<SweepStats> {
        let repos = self.host.list_installation_repos().await?;
        let mut stats = SweepStats::default();

        for repo in repos {
            stats.evaluated += 1;
            match self.evaluate_repo(&repo).await {
                Ok(true) => stats.dispatched += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!("sweep: {}/{} failed: {e}", repo.owner, repo.repo);
                    stats.failed += 1;
                }
            }
        }

        info!(
            "sweep done: {} evaluated, {} dispatched, {} skipped, {} failed",
            stats.evaluated, stats.dispatched, stats.skipped, stats.failed
        );
        Ok(stats)
    }

    /// Returns true when a dispatch event was fired for this repository.
    async fn evaluate_repo(&self, repo: &RepoRef) -> Result<bool> {
        match self.store.get_schedule(&repo.owner, &repo.repo)? {
            // Unseen repositories are always dispatched once to establish
            // a baseline.
            None => {
                info!("sweep: {}/{} has no schedule, dispatching", repo.owner, repo.repo);
                self.fire_dispatch(repo).await?;
                Ok(true)
            }
            Some(record) => {
                let eval = ScheduleEvaluation::evaluate(
                    Utc::now(),
                    record.last_dispatched_at,
                    record.interval,
                );
                if eval.is_due() {
                    info!(
                        "sweep: {}/{} due since {}, dispatching",
                        repo.owner, repo.repo, eval.due_at
                    );
                    self.fire_dispatch(repo).await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn fire_dispatch(&self, repo: &RepoRef) -> Result<()> {
        self.host
            .create_dispatch_event(
                &repo.owner,
                &repo.repo,
                DISPATCH_EVENT_TYPE,
                json!({ "owner": repo.owner, "repo": repo.repo }),
            )
            .await
    }
}
