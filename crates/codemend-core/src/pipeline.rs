use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::github::RepoHost;
use crate::runner::Runner;
use crate::schedule::{sanitize_interval, Interval};
use crate::store::ScheduleStore;
use crate::types::{PullHead, RemediationEvent, RepoSettings, RunOutcome, ScheduleRecord, ToolReport};
use crate::workspace::Workspace;

pub const PR_TITLE: &str = "Codemend recommendations";
pub const PR_BODY_PREAMBLE: &str = "This pull request was automatically generated by codemend.";
pub const COMMIT_MESSAGE: &str = "Fix lint rule violations";

/// Pick the open proposal branch for this tool out of a pull listing.
/// Returns the bare branch name from the `owner:branch` head label.
pub fn proposal_ref<'a>(pulls: &'a [PullHead], tool: &str) -> Option<&'a str> {
    let needle = format!("remediation/{tool}");
    pulls
        .iter()
        .find(|p| p.head_label.contains(&needle))
        .map(|p| p.head_label.split(':').nth(1).unwrap_or(&p.head_ref))
}

/// Drives one repository through clone → lint → diff → (propose | no-op).
///
/// Runs are serialized per repository by an in-flight set; a second event
/// for a busy repository is dropped. Within a run every step is sequential
/// and the first failure aborts the run after workspace cleanup.
pub struct Remediator {
    host: Arc<dyn RepoHost>,
    store: Arc<ScheduleStore>,
    config: Arc<Config>,
    runner: Runner,
    in_flight: Mutex<HashSet<String>>,
}

impl Remediator {
    pub fn new(host: Arc<dyn RepoHost>, store: Arc<ScheduleStore>, config: Arc<Config>) -> Self {
        let runner = Runner::new(config.command_timeout_s);
        Self {
            host,
            store,
            config,
            runner,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Entry point for dispatch events: schedule bookkeeping plus one run.
    pub async fn handle_event(&self, event: &RemediationEvent) -> Result<RunOutcome> {
        self.guarded(event, true).await
    }

    /// Entry point for manual scans (repository.edited): one run, no
    /// schedule bookkeeping.
    pub async fn run_manual(&self, event: &RemediationEvent) -> Result<RunOutcome> {
        self.guarded(event, false).await
    }

    async fn guarded(&self, event: &RemediationEvent, bookkeeping: bool) -> Result<RunOutcome> {
        let key = format!("{}/{}", event.owner, event.repo);
        {
            let mut guard = self.in_flight.lock().await;
            if !guard.insert(key.clone()) {
                info!("run already in flight for {key}, dropping event");
                return Ok(RunOutcome::Busy);
            }
        }

        let result = if bookkeeping {
            self.run_with_bookkeeping(event).await
        } else {
            let settings = self.load_settings(&event.owner, &event.repo).await;
            self.run_once(event, &settings).await
        };

        self.in_flight.lock().await.remove(&key);
        result
    }

    /// First-seen repositories get their record stored before the run;
    /// known repositories run first and have their timestamp refreshed
    /// afterwards.
    async fn run_with_bookkeeping(&self, event: &RemediationEvent) -> Result<RunOutcome> {
        let settings = self.load_settings(&event.owner, &event.repo).await;
        let interval = self.resolve_interval(&settings)?;
        let now = Utc::now();

        match self.store.get_schedule(&event.owner, &event.repo)? {
            None => {
                self.store.store_schedule(&ScheduleRecord {
                    owner: event.owner.clone(),
                    repo: event.repo.clone(),
                    interval,
                    last_dispatched_at: now,
                })?;
                self.run_once(event, &settings).await
            }
            Some(mut record) => {
                let outcome = self.run_once(event, &settings).await?;
                record.last_dispatched_at = now;
                self.store.update_last_dispatched(&record)?;
                Ok(outcome)
            }
        }
    }

    fn resolve_interval(&self, settings: &RepoSettings) -> Result<Interval> {
        let raw = settings
            .schedule
            .interval
            .as_deref()
            .unwrap_or(&self.config.default_interval);
        sanitize_interval(raw).parse()
    }

    async fn load_settings(&self, owner: &str, repo: &str) -> RepoSettings {
        let raw = match self
            .host
            .fetch_repo_settings(owner, repo, &self.config.settings_file)
            .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => return RepoSettings::default(),
            Err(e) => {
                warn!("settings fetch for {owner}/{repo} failed, using defaults: {e}");
                return RepoSettings::default();
            }
        };
        match serde_yaml::from_str(&raw) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("malformed settings file in {owner}/{repo}, using defaults: {e}");
                RepoSettings::default()
            }
        }
    }

    /// One end-to-end remediation run for a repository at its latest commit.
    async fn run_once(
        &self,
        event: &RemediationEvent,
        settings: &RepoSettings,
    ) -> Result<RunOutcome> {
        let owner = &event.owner;
        let repo = &event.repo;
        let tool = &self.config.lint_tool;

        let commit = self
            .host
            .latest_commit(owner, repo, &event.default_branch)
            .await?;
        let branch = Workspace::branch_name(tool, &commit);

        // Idempotency against re-delivery: a remediation branch whose parent
        // is this exact commit means the work is already proposed.
        if let Some(parent) = self.host.branch_parent_commit(owner, repo, &branch).await? {
            if parent == commit {
                info!("proposal for {owner}/{repo} already at {commit}, skipping");
                return Ok(RunOutcome::AlreadyProposed);
            }
        }

        let remote_url = self.host.clone_url(owner, repo);
        let workspace = Workspace::clone_fresh(
            self.runner.clone(),
            Path::new(&self.config.base_clone_path),
            owner,
            repo,
            &commit,
            &remote_url,
        )
        .await?;

        // Baseline: the diff an already-open proposal carries, if any.
        let pulls = self.host.list_open_pulls(owner, repo).await?;
        let baseline = match proposal_ref(&pulls, tool) {
            Some(proposal) => workspace.existing_proposal_diff(proposal).await?,
            None => String::new(),
        };

        workspace.create_branch(&branch).await?;

        let Some(executable) = self.runner.find_executable(tool).await else {
            workspace.remove().await;
            return Err(Error::ToolUnavailable(tool.clone()));
        };

        let report = self.run_lint(&executable, &workspace, settings).await?;
        if !report.success() {
            warn!(
                "{tool} exited with status {} for {owner}/{repo}, report kept",
                report.exit_status
            );
        }

        if !workspace.has_changes().await? {
            return Ok(RunOutcome::NoChanges);
        }

        let diff = workspace.diff().await?;
        if diff == baseline {
            info!("open proposal for {owner}/{repo} already carries the latest fix");
            workspace.remove().await;
            return Ok(RunOutcome::Duplicate);
        }

        workspace.commit_all(COMMIT_MESSAGE).await?;
        workspace.push(&branch, &remote_url).await?;

        let body = format!("{PR_BODY_PREAMBLE}\n```\n{}\n```", report.body_text());
        let pull_number = self
            .host
            .create_pull(owner, repo, PR_TITLE, &body, &branch, &event.default_branch)
            .await?;

        workspace.remove().await;
        Ok(RunOutcome::Proposed {
            branch,
            pull_number,
        })
    }

    /// Run the lint tool with auto-fix in the workspace, capturing combined
    /// output into a [`ToolReport`] even when the tool exits non-zero.
    async fn run_lint(
        &self,
        executable: &Path,
        workspace: &Workspace,
        settings: &RepoSettings,
    ) -> Result<ToolReport> {
        let mut args: Vec<&str> = vec!["--exclude", ".github", "--format", "md", "--fix", "all"];
        if let Some(config_file) = settings.lint.config_file.as_deref() {
            args.push("--config-file");
            args.push(config_file);
        }
        if let Some(rules_dir) = settings.lint.rules_dir.as_deref() {
            args.push("--rules-dir");
            args.push(rules_dir);
        }

        let program = executable.to_string_lossy();
        info!("running {program} {}", args.join(" "));

        let (output, status) = self
            .runner
            .run_unchecked(&program, &args, Some(workspace.path()), Some(executable))
            .await?;

        Ok(ToolReport::from_output(&output.stdout, &output.stderr, status))
    }
}
