//! Narrow façades over the outside world.
//!
//! Each adapter is a small trait the kernel consumes: messaging egress,
//! source control, subprocess execution, AI provider calls, and audio
//! transcription. Implementations map their own failures onto
//! [`AdapterError`] at the boundary and honor a caller-specified deadline.
//! Tests substitute plain structs; dev mode substitutes a simulated
//! subprocess.

mod github;
mod provider;
mod subprocess;

pub use github::GitHubAdapter;
pub use provider::{GroqTranscriber, OpenAiCompatProvider};
pub use subprocess::{LocalProcessAdapter, SimulatedProcessAdapter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::AdapterError;

/// Outbound message options. Transports ignore what they cannot express.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    /// Render as preformatted/code when the transport supports it.
    pub preformatted: bool,
    /// Suppress notification sound when the transport supports it.
    pub silent: bool,
}

/// The single outbound path the kernel uses.
///
/// Implementations must be safe to call concurrently from scheduler ticks
/// and orchestrator stages.
#[async_trait]
pub trait MessagingAdapter: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str, opts: SendOptions)
        -> Result<(), AdapterError>;
}

/// Result of a subprocess run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Set when the process was killed at the deadline.
    pub killed: bool,
    /// Set by simulated adapters; real runs leave this false.
    pub simulated: bool,
}

impl CommandOutput {
    /// Stdout if non-empty, else stderr. What a chat user wants to see.
    pub fn display_output(&self) -> &str {
        if self.stdout.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

/// Runs whitelisted commands for the orchestrator.
#[async_trait]
pub trait SubprocessAdapter: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
        env: &HashMap<String, String>,
    ) -> Result<CommandOutput, AdapterError>;
}

/// A pull request, as much of it as the kernel cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub author: String,
    pub head_ref: String,
    pub url: String,
}

/// An issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub author: String,
    pub url: String,
}

/// A workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub head_branch: String,
    pub url: String,
}

/// A commit summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: String,
    pub message: String,
    pub author: String,
}

/// Narrow façade over the source-control host.
#[async_trait]
pub trait SourceControlAdapter: Send + Sync {
    async fn list_repos(&self) -> Result<Vec<String>, AdapterError>;
    async fn read_file(&self, repo: &str, path: &str) -> Result<String, AdapterError>;
    async fn search_code(&self, repo: &str, query: &str) -> Result<Vec<String>, AdapterError>;
    async fn list_branches(&self, repo: &str) -> Result<Vec<String>, AdapterError>;
    async fn list_commits(&self, repo: &str, limit: usize)
        -> Result<Vec<CommitSummary>, AdapterError>;
    async fn get_pull_request(&self, repo: &str, number: u64)
        -> Result<PullRequest, AdapterError>;
    async fn list_pull_requests(&self, repo: &str) -> Result<Vec<PullRequest>, AdapterError>;
    async fn list_issues(&self, repo: &str) -> Result<Vec<Issue>, AdapterError>;
    async fn create_issue(&self, repo: &str, title: &str, body: &str)
        -> Result<Issue, AdapterError>;
    async fn comment_issue(&self, repo: &str, number: u64, body: &str)
        -> Result<(), AdapterError>;
    async fn close_issue(&self, repo: &str, number: u64) -> Result<(), AdapterError>;
    async fn list_workflow_runs(&self, repo: &str, limit: usize)
        -> Result<Vec<WorkflowRun>, AdapterError>;
    async fn dispatch_workflow(&self, repo: &str, workflow: &str, git_ref: &str)
        -> Result<(), AdapterError>;
}

/// A classification verdict from the intent classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    /// [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub ambiguous: bool,
    #[serde(default = "default_risk")]
    pub risk: RiskLevel,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub clarifying_questions: Vec<String>,
    /// Per-factor contributions to the confidence score.
    #[serde(default)]
    pub confidence_factors: HashMap<String, f64>,
}

fn default_risk() -> RiskLevel {
    RiskLevel::Low
}

/// Risk attached to a classified action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Med,
    High,
}

/// A chat completion reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub provider: String,
    pub model: String,
}

/// One chat message for the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// AI provider façade: intent classification and free-form chat.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        context: &serde_json::Value,
    ) -> Result<Classification, AdapterError>;

    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatReply, AdapterError>;
}

/// Audio transcription façade.
#[async_trait]
pub trait TranscriberAdapter: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_output_prefers_stdout() {
        let out = CommandOutput {
            success: true,
            stdout: "ok\n".into(),
            stderr: "warning\n".into(),
            killed: false,
            simulated: false,
        };
        assert_eq!(out.display_output(), "ok\n");

        let out = CommandOutput {
            success: false,
            stdout: "  ".into(),
            stderr: "boom".into(),
            killed: false,
            simulated: false,
        };
        assert_eq!(out.display_output(), "boom");
    }

    #[test]
    fn test_classification_defaults() {
        let c: Classification = serde_json::from_str(
            r#"{"intent": "deploy", "confidence": 0.9}"#,
        )
        .unwrap();
        assert_eq!(c.risk, RiskLevel::Low);
        assert!(!c.ambiguous);
        assert!(c.alternatives.is_empty());
    }
}
