use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{PullHead, RepoRef};

const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("codemend/", env!("CARGO_PKG_VERSION"));

/// Remote repository API consumed by the sweep and the pipeline.
///
/// The trait is the seam for tests; `GithubClient` is the production
/// implementation.
#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Latest commit sha on the given branch.
    async fn latest_commit(&self, owner: &str, repo: &str, branch: &str) -> Result<String>;

    /// First-parent sha of the tip of `branch`, or `None` when the branch
    /// does not exist on the remote.
    async fn branch_parent_commit(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<String>>;

    async fn list_open_pulls(&self, owner: &str, repo: &str) -> Result<Vec<PullHead>>;

    async fn create_pull(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<i64>;

    async fn create_dispatch_event(
        &self,
        owner: &str,
        repo: &str,
        event_type: &str,
        client_payload: Value,
    ) -> Result<()>;

    /// Every repository visible to the current installation.
    async fn list_installation_repos(&self) -> Result<Vec<RepoRef>>;

    /// Raw contents of a file in the repository, or `None` when absent.
    async fn fetch_repo_settings(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>>;

    /// Authenticated clone URL for a repository.
    fn clone_url(&self, owner: &str, repo: &str) -> String;
}

// ── GithubClient ─────────────────────────────────────────────────────────

pub struct GithubClient {
    client: Client,
    base_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
    }

    fn json_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.request(method, path)
            .header("Accept", "application/vnd.github+json")
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let resp = self.json_request(reqwest::Method::GET, path).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::RemoteApi(format!("GET {path} returned {status}")));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl RepoHost for GithubClient {
    async fn latest_commit(&self, owner: &str, repo: &str, branch: &str) -> Result<String> {
        let v = self
            .get_json(&format!("/repos/{owner}/{repo}/commits/{branch}"))
            .await?;
        v["sha"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::RemoteApi(format!("no sha for {owner}/{repo}@{branch}")))
    }

    async fn branch_parent_commit(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .json_request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/branches/{branch}"),
            )
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::RemoteApi(format!(
                "branch query for {branch} returned {status}"
            )));
        }
        let v: Value = resp.json().await?;
        Ok(v["commit"]["parents"][0]["sha"].as_str().map(str::to_string))
    }

    async fn list_open_pulls(&self, owner: &str, repo: &str) -> Result<Vec<PullHead>> {
        let v = self
            .get_json(&format!("/repos/{owner}/{repo}/pulls?state=open&per_page=100"))
            .await?;
        let pulls = v.as_array().cloned().unwrap_or_default();
        Ok(pulls
            .iter()
            .map(|p| PullHead {
                number: p["number"].as_i64().unwrap_or(0),
                head_label: p["head"]["label"].as_str().unwrap_or("").to_string(),
                head_ref: p["head"]["ref"].as_str().unwrap_or("").to_string(),
            })
            .collect())
    }

    async fn create_pull(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<i64> {
        let resp = self
            .json_request(reqwest::Method::POST, &format!("/repos/{owner}/{repo}/pulls"))
            .json(&json!({
                "title": title,
                "body": body,
                "head": head,
                "base": base,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::RemoteApi(format!(
                "pull creation for {owner}/{repo} returned {status}"
            )));
        }
        let v: Value = resp.json().await?;
        let number = v["number"].as_i64().unwrap_or(0);
        info!("created pull request #{number} for {owner}/{repo}");
        Ok(number)
    }

    async fn create_dispatch_event(
        &self,
        owner: &str,
        repo: &str,
        event_type: &str,
        client_payload: Value,
    ) -> Result<()> {
        let resp = self
            .json_request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo}/dispatches"),
            )
            .json(&json!({
                "event_type": event_type,
                "client_payload": client_payload,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::RemoteApi(format!(
                "dispatch event for {owner}/{repo} returned {status}"
            )));
        }
        info!("dispatch event fired for {owner}/{repo}");
        Ok(())
    }

    async fn list_installation_repos(&self) -> Result<Vec<RepoRef>> {
        let mut repos = Vec::new();
        let mut page = 1u32;
        loop {
            let v = self
                .get_json(&format!("/installation/repositories?per_page=100&page={page}"))
                .await?;
            let batch = v["repositories"].as_array().cloned().unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            for r in &batch {
                let owner = r["owner"]["login"].as_str().unwrap_or("").to_string();
                let repo = r["name"].as_str().unwrap_or("").to_string();
                if owner.is_empty() || repo.is_empty() {
                    continue;
                }
                repos.push(RepoRef {
                    owner,
                    repo,
                    default_branch: r["default_branch"].as_str().unwrap_or("main").to_string(),
                });
            }
            if batch.len() < 100 {
                break;
            }
            page += 1;
        }
        Ok(repos)
    }

    async fn fetch_repo_settings(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/contents/{path}"),
            )
            .header("Accept", "application/vnd.github.raw")
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::RemoteApi(format!(
                "settings fetch for {owner}/{repo} returned {status}"
            )));
        }
        Ok(Some(resp.text().await?))
    }

    fn clone_url(&self, owner: &str, repo: &str) -> String {
        format!("https://{owner}:{}@github.com/{owner}/{repo}.git", self.token)
    }
}
