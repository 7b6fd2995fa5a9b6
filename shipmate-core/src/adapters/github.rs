//! GitHub façade implementing [`SourceControlAdapter`] over the REST API.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{CommitSummary, Issue, PullRequest, SourceControlAdapter, WorkflowRun};
use crate::error::AdapterError;

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "shipmate-bot";

/// Thin REST client. One owner account, token auth, bounded deadlines.
pub struct GitHubAdapter {
    client: Client,
    owner: String,
    token: String,
    timeout: Duration,
}

impl GitHubAdapter {
    pub fn new(owner: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            owner: owner.into(),
            token: token.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get(&self, path: &str) -> Result<Value, AdapterError> {
        self.request(reqwest::Method::GET, path, None).await
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, AdapterError> {
        debug!(%method, path, "github request");
        let mut req = self
            .client
            .request(method, format!("{API_BASE}{path}"))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .timeout(self.timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout {
                    adapter: "github".into(),
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                AdapterError::Request {
                    adapter: "github".into(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Status {
                adapter: "github".into(),
                status: status.as_u16(),
                message: truncate(&message, 300),
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        resp.json().await.map_err(|e| AdapterError::ResponseParse {
            adapter: "github".into(),
            message: e.to_string(),
        })
    }

    fn repo_path(&self, repo: &str, rest: &str) -> String {
        format!("/repos/{}/{}{}", self.owner, repo, rest)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &s[..cut])
}

fn str_at<'a>(v: &'a Value, pointer: &str) -> &'a str {
    v.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

fn parse_pr(v: &Value) -> PullRequest {
    PullRequest {
        number: v["number"].as_u64().unwrap_or(0),
        title: str_at(v, "/title").to_string(),
        state: str_at(v, "/state").to_string(),
        author: str_at(v, "/user/login").to_string(),
        head_ref: str_at(v, "/head/ref").to_string(),
        url: str_at(v, "/html_url").to_string(),
    }
}

fn parse_issue(v: &Value) -> Issue {
    Issue {
        number: v["number"].as_u64().unwrap_or(0),
        title: str_at(v, "/title").to_string(),
        state: str_at(v, "/state").to_string(),
        author: str_at(v, "/user/login").to_string(),
        url: str_at(v, "/html_url").to_string(),
    }
}

#[async_trait]
impl SourceControlAdapter for GitHubAdapter {
    async fn list_repos(&self) -> Result<Vec<String>, AdapterError> {
        let v = self.get("/user/repos?per_page=100&sort=pushed").await?;
        Ok(v.as_array()
            .map(|repos| {
                repos
                    .iter()
                    .filter_map(|r| r["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_file(&self, repo: &str, path: &str) -> Result<String, AdapterError> {
        let v = self.get(&self.repo_path(repo, &format!("/contents/{path}"))).await?;
        let content = str_at(&v, "/content").replace(['\n', '\r'], "");
        let bytes = BASE64.decode(content).map_err(|e| AdapterError::ResponseParse {
            adapter: "github".into(),
            message: format!("content not base64: {e}"),
        })?;
        String::from_utf8(bytes).map_err(|e| AdapterError::ResponseParse {
            adapter: "github".into(),
            message: format!("content not utf-8: {e}"),
        })
    }

    async fn search_code(&self, repo: &str, query: &str) -> Result<Vec<String>, AdapterError> {
        let q = format!("{query}+repo:{}/{repo}", self.owner);
        let v = self.get(&format!("/search/code?q={q}&per_page=20")).await?;
        Ok(v["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i["path"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_branches(&self, repo: &str) -> Result<Vec<String>, AdapterError> {
        let v = self.get(&self.repo_path(repo, "/branches?per_page=100")).await?;
        Ok(v.as_array()
            .map(|bs| {
                bs.iter()
                    .filter_map(|b| b["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_commits(
        &self,
        repo: &str,
        limit: usize,
    ) -> Result<Vec<CommitSummary>, AdapterError> {
        let v = self
            .get(&self.repo_path(repo, &format!("/commits?per_page={limit}")))
            .await?;
        Ok(v.as_array()
            .map(|cs| {
                cs.iter()
                    .map(|c| CommitSummary {
                        sha: str_at(c, "/sha").chars().take(7).collect(),
                        message: str_at(c, "/commit/message")
                            .lines()
                            .next()
                            .unwrap_or("")
                            .to_string(),
                        author: str_at(c, "/commit/author/name").to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_pull_request(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<PullRequest, AdapterError> {
        let v = self.get(&self.repo_path(repo, &format!("/pulls/{number}"))).await?;
        Ok(parse_pr(&v))
    }

    async fn list_pull_requests(&self, repo: &str) -> Result<Vec<PullRequest>, AdapterError> {
        let v = self.get(&self.repo_path(repo, "/pulls?state=open")).await?;
        Ok(v.as_array().map(|prs| prs.iter().map(parse_pr).collect()).unwrap_or_default())
    }

    async fn list_issues(&self, repo: &str) -> Result<Vec<Issue>, AdapterError> {
        let v = self.get(&self.repo_path(repo, "/issues?state=open")).await?;
        Ok(v.as_array()
            .map(|issues| {
                issues
                    .iter()
                    // The issues endpoint also returns PRs; drop them.
                    .filter(|i| i.get("pull_request").is_none())
                    .map(parse_issue)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<Issue, AdapterError> {
        let v = self
            .request(
                reqwest::Method::POST,
                &self.repo_path(repo, "/issues"),
                Some(serde_json::json!({"title": title, "body": body})),
            )
            .await?;
        Ok(parse_issue(&v))
    }

    async fn comment_issue(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), AdapterError> {
        self.request(
            reqwest::Method::POST,
            &self.repo_path(repo, &format!("/issues/{number}/comments")),
            Some(serde_json::json!({"body": body})),
        )
        .await?;
        Ok(())
    }

    async fn close_issue(&self, repo: &str, number: u64) -> Result<(), AdapterError> {
        self.request(
            reqwest::Method::PATCH,
            &self.repo_path(repo, &format!("/issues/{number}")),
            Some(serde_json::json!({"state": "closed"})),
        )
        .await?;
        Ok(())
    }

    async fn list_workflow_runs(
        &self,
        repo: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, AdapterError> {
        let v = self
            .get(&self.repo_path(repo, &format!("/actions/runs?per_page={limit}")))
            .await?;
        Ok(v["workflow_runs"]
            .as_array()
            .map(|runs| {
                runs.iter()
                    .map(|r| WorkflowRun {
                        id: r["id"].as_u64().unwrap_or(0),
                        name: str_at(r, "/name").to_string(),
                        status: str_at(r, "/status").to_string(),
                        conclusion: r["conclusion"].as_str().map(String::from),
                        head_branch: str_at(r, "/head_branch").to_string(),
                        url: str_at(r, "/html_url").to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn dispatch_workflow(
        &self,
        repo: &str,
        workflow: &str,
        git_ref: &str,
    ) -> Result<(), AdapterError> {
        self.request(
            reqwest::Method::POST,
            &self.repo_path(repo, &format!("/actions/workflows/{workflow}/dispatches")),
            Some(serde_json::json!({"ref": git_ref})),
        )
        .await?;
        Ok(())
    }
}
