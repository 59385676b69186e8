use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::Interval;

// ── Schedule state ───────────────────────────────────────────────────────

/// Persisted scheduling state for one (owner, repo) pair.
///
/// Created the first time a dispatch event is processed for a repository
/// with no record; thereafter only `last_dispatched_at` is refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub owner: String,
    pub repo: String,
    pub interval: Interval,
    pub last_dispatched_at: DateTime<Utc>,
}

// ── Remote repository references ─────────────────────────────────────────

/// A repository visible to the current installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub default_branch: String,
}

/// The head of an open pull request, as returned by the pull listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullHead {
    pub number: i64,
    /// `owner:branch` label of the head ref.
    pub head_label: String,
    /// Bare branch name of the head ref.
    pub head_ref: String,
}

// ── Remediation events ───────────────────────────────────────────────────

/// An inbound signal that a repository should be remediated now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationEvent {
    pub installation_id: i64,
    pub owner: String,
    pub repo: String,
    pub default_branch: String,
    /// Branch named in the dispatch payload, if any. A dispatch for a
    /// non-default branch is skipped by the caller.
    pub dispatched_branch: Option<String>,
}

// ── Tool report ──────────────────────────────────────────────────────────

/// Captured output of one lint tool invocation, carried immutably through
/// the pipeline and embedded in the pull-request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReport {
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub exit_status: i32,
}

impl ToolReport {
    pub fn from_output(stdout: &str, stderr: &str, exit_status: i32) -> Self {
        Self {
            stdout_lines: stdout.lines().map(str::to_string).collect(),
            stderr_lines: stderr.lines().map(str::to_string).collect(),
            exit_status,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Stdout lines followed by stderr lines, joined for the PR body.
    pub fn body_text(&self) -> String {
        let mut lines: Vec<&str> = self.stdout_lines.iter().map(String::as_str).collect();
        lines.extend(self.stderr_lines.iter().map(String::as_str));
        lines.join("\n")
    }
}

// ── Run outcome ──────────────────────────────────────────────────────────

/// Discriminated result of one remediation run, so callers and tests can
/// tell which early-exit branch was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    /// A remediation branch already sits on the latest commit.
    AlreadyProposed,
    /// Another run for this repository is still in flight; event dropped.
    Busy,
    /// The tool produced no working-tree changes.
    NoChanges,
    /// The new diff textually equals the open proposal's diff.
    Duplicate,
    /// A pull request was opened.
    Proposed { branch: String, pull_number: i64 },
}

// ── Per-repository settings ──────────────────────────────────────────────

/// Per-repository settings loaded from a YAML file in the target
/// repository, with defaults when the file is absent or malformed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepoSettings {
    pub schedule: ScheduleSettings,
    pub lint: LintSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Raw interval string; sanitized and parsed before use.
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LintSettings {
    pub config_file: Option<String>,
    pub rules_dir: Option<String>,
}

// ── Sweep statistics ─────────────────────────────────────────────────────

/// Counters for one dispatch sweep over all visible repositories.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepStats {
    pub evaluated: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
}
