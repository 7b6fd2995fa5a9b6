//! Deploy pipelines from chat: test, deploy, verify, rollback, history,
//! and the confirm/cancel flow guarding every deploy.

use async_trait::async_trait;
use regex::Regex;

use shipmate_core::error::{ErrorKind, ShipmateError};
use shipmate_core::orchestrator::{PendingAction, PipelineOutcome, StageResult, StageStatus};
use shipmate_core::skills::helpers::SkillLogger;
use shipmate_core::skills::{CommandSpec, MessageContext, Skill};
use shipmate_core::types::SkillResult;

/// Runs and reports orchestrator pipelines.
pub struct PipelineSkill {
    confirm_re: Regex,
    cancel_re: Regex,
    log: SkillLogger,
}

impl PipelineSkill {
    pub fn new() -> Self {
        Self {
            confirm_re: Regex::new(r"(?i)^confirm\s+(\S+)$").expect("static pattern"),
            cancel_re: Regex::new(r"(?i)^cancel\s+(\S+)$").expect("static pattern"),
            log: SkillLogger::new("pipeline"),
        }
    }

    /// Resolve the target: explicit argument, else the chat's registered
    /// repo.
    fn target(&self, arg: Option<&str>, ctx: &MessageContext) -> Option<String> {
        arg.map(String::from).or_else(|| ctx.chat.repo.clone())
    }

    fn pending_reply(&self, pending: &PendingAction) -> SkillResult {
        SkillResult::ok(format!(
            "{} {} ready. Confirm with: confirm {}  (expires in {}s)",
            capitalize(&pending.action),
            pending.target,
            pending.token,
            pending.expires_in_secs
        ))
        .with_data(serde_json::json!({"token": pending.token, "target": pending.target}))
    }

    fn status(&self, ctx: &MessageContext) -> SkillResult {
        let orchestrator = &ctx.services.orchestrator;
        let active = orchestrator.active_targets();
        let history = orchestrator.history().recent(5);

        let mut lines = Vec::new();
        if active.is_empty() {
            lines.push("No pipeline running.".to_string());
        } else {
            lines.push(format!("Running: {}", active.join(", ")));
        }
        if history.is_empty() {
            lines.push("No deployments recorded this session.".to_string());
        } else {
            lines.push("Recent:".to_string());
            for r in &history {
                lines.push(format!(
                    "  {} {} {} ({}ms){}",
                    r.timestamp.format("%m-%d %H:%M"),
                    r.target,
                    if r.deploy_success { "ok" } else { "failed" },
                    r.duration_ms,
                    if r.is_rollback { " [rollback]" } else { "" },
                ));
            }
        }
        SkillResult::ok(lines.join("\n"))
    }
}

impl Default for PipelineSkill {
    fn default() -> Self {
        Self::new()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Render a pipeline outcome for chat.
pub fn format_outcome(outcome: &PipelineOutcome) -> String {
    let what = if outcome.is_rollback { "Rollback" } else { "Pipeline" };
    let verify_warned = outcome
        .stages
        .iter()
        .any(|s| s.name == "verify" && s.status == StageStatus::Warning);
    let headline = if outcome.success {
        if verify_warned {
            format!("{what} Complete (verify warning): {}", outcome.target)
        } else {
            format!("{what} Complete: {}", outcome.target)
        }
    } else {
        format!("{what} Failed: {}", outcome.target)
    };

    let mut lines = vec![headline];
    for stage in &outcome.stages {
        lines.push(format_stage(stage));
    }
    if let Some(url) = &outcome.url {
        lines.push(format!("URL: {url}"));
    }
    lines.push(format!("Total: {}ms", outcome.total_duration_ms));
    lines.join("\n")
}

fn format_stage(stage: &StageResult) -> String {
    let name = capitalize(&stage.name);
    match stage.status {
        StageStatus::Passed => format!("{name} [{}] ({}ms)", stage.status.tag(), stage.duration_ms),
        StageStatus::Skipped => format!("{name} [{}] - {}", stage.status.tag(), stage.output),
        StageStatus::Warning => format!("{name} [{}] - {}", stage.status.tag(), stage.output),
        StageStatus::Failed => {
            let preview: String = stage.output.lines().take(5).collect::<Vec<_>>().join("\n  ");
            format!("{name} [{}]\n  {preview}", stage.status.tag())
        }
    }
}

#[async_trait]
impl Skill for PipelineSkill {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn description(&self) -> &str {
        "Test, deploy, verify, and roll back registered projects"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec {
                pattern: r"^pipeline deploy <repo>".into(),
                usage: "pipeline deploy <repo>".into(),
                description: "run test -> deploy -> verify (confirmation required)".into(),
            },
            CommandSpec {
                pattern: r"^pipeline <repo>".into(),
                usage: "pipeline <repo>".into(),
                description: "alias for pipeline deploy".into(),
            },
            CommandSpec {
                pattern: r"^pipeline test <repo>".into(),
                usage: "pipeline test <repo>".into(),
                description: "run only the test stage".into(),
            },
            CommandSpec {
                pattern: r"^pipeline status$".into(),
                usage: "pipeline status | deploy history".into(),
                description: "active pipelines and recent deployments".into(),
            },
            CommandSpec {
                pattern: r"^pipeline rollback <repo>".into(),
                usage: "pipeline rollback <repo>".into(),
                description: "revert to the prior revision and redeploy".into(),
            },
            CommandSpec {
                pattern: r"^confirm <token>".into(),
                usage: "confirm <token> | cancel <token>".into(),
                description: "approve or discard a pending action".into(),
            },
        ]
    }

    fn can_handle(&self, text: &str, _ctx: &MessageContext) -> bool {
        let t = text.trim().to_lowercase();
        t.starts_with("pipeline")
            || t == "deploy history"
            || self.confirm_re.is_match(text.trim())
            || self.cancel_re.is_match(text.trim())
    }

    async fn execute(
        &self,
        text: &str,
        ctx: &MessageContext,
    ) -> Result<SkillResult, ShipmateError> {
        let text = text.trim();
        let lower = text.to_lowercase();
        let orchestrator = &ctx.services.orchestrator;
        let by = ctx.message.sender_id.as_str();

        if let Some(token) = self.confirm_re.captures(text).map(|c| c[1].to_string()) {
            self.log.info(&format!("confirm {token}"));
            let outcome = orchestrator.confirm_and_run(&token, by).await?;
            return Ok(SkillResult {
                success: outcome.success,
                ..SkillResult::ok(format_outcome(&outcome))
            });
        }
        if let Some(token) = self.cancel_re.captures(text).map(|c| c[1].to_string()) {
            return Ok(if orchestrator.cancel_pending(&token) {
                SkillResult::ok("Pending action cancelled.")
            } else {
                SkillResult::err(ErrorKind::NotFound, "No such pending action.")
                    .with_suggestion("tokens expire after a few minutes")
            });
        }

        if lower == "pipeline status" || lower == "deploy history" {
            return Ok(self.status(ctx));
        }

        // `pipeline <repo>` is an alias for `pipeline deploy <repo>`.
        let args: Vec<&str> = text.split_whitespace().collect();
        let (verb, target_arg) = match args.as_slice() {
            ["pipeline", "deploy"] => ("deploy", None),
            ["pipeline", "deploy", t] => ("deploy", Some(*t)),
            ["pipeline", "test"] => ("test", None),
            ["pipeline", "test", t] => ("test", Some(*t)),
            ["pipeline", "rollback"] => ("rollback", None),
            ["pipeline", "rollback", t] => ("rollback", Some(*t)),
            ["pipeline", t] => ("deploy", Some(*t)),
            _ => {
                return Ok(SkillResult::err(ErrorKind::BadArgument, "Unrecognized pipeline command.")
                    .with_attempted(text.to_string())
                    .with_suggestion("pipeline deploy <repo> | pipeline status"))
            }
        };
        let Some(target) = self.target(target_arg, ctx) else {
            return Ok(SkillResult::err(
                ErrorKind::BadArgument,
                "Which project? This chat has no registered repo.",
            )
            .with_attempted(format!("pipeline {verb}"))
            .with_suggestion("pipeline deploy <repo>, or register this chat for one"));
        };
        match verb {
            "deploy" => {
                let pending = orchestrator.request_deploy(&target, by)?;
                Ok(self.pending_reply(&pending))
            }
            "rollback" => {
                let pending = orchestrator.request_rollback(&target, by)?;
                Ok(self.pending_reply(&pending))
            }
            _ => {
                let stage = orchestrator.run_tests(&target, by).await?;
                let passed = stage.status == StageStatus::Passed;
                Ok(SkillResult {
                    success: passed,
                    ..SkillResult::ok(format!("Tests for {target}:\n{}", format_stage(&stage)))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipmate_core::registry::ChatContext;
    use shipmate_core::test_support::services;
    use shipmate_core::types::InboundMessage;

    async fn ctx_for(chat: &str) -> MessageContext {
        MessageContext {
            message: InboundMessage::text(chat, "u1", "", "test"),
            chat: Default::default(),
            services: services().await,
        }
    }

    fn token_from(result: &SkillResult) -> String {
        result.data.as_ref().unwrap()["token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_deploy_happy_path_scenario() {
        let skill = PipelineSkill::new();
        let ctx = ctx_for("C1").await;

        let pending = skill
            .execute("pipeline deploy aws-clawd-bot", &ctx)
            .await
            .unwrap();
        assert!(pending.success);
        assert!(pending.message.contains("confirm "));

        let token = token_from(&pending);
        let done = skill.execute(&format!("confirm {token}"), &ctx).await.unwrap();
        assert!(done.success, "{}", done.message);
        // Three stage lines, all PASS, a URL, a non-zero total.
        assert_eq!(done.message.matches("[PASS]").count(), 3);
        assert!(done.message.contains("URL: https://"));
        assert!(done.message.contains("Total: "));
        assert!(!done.message.contains("Total: 0ms"));

        let history = ctx.services.orchestrator.history().recent(1);
        assert!(history[0].deploy_success);
        assert!(!history[0].is_rollback);
    }

    #[tokio::test]
    async fn test_alias_and_ambient_repo() {
        let skill = PipelineSkill::new();
        let mut ctx = ctx_for("C1").await;
        ctx.chat = ChatContext {
            repo: Some("aws-clawd-bot".into()),
            ..ChatContext::default()
        };

        // Bare alias uses the chat's registered repo.
        let result = skill.execute("pipeline deploy", &ctx).await.unwrap();
        assert!(result.success, "{}", result.message);
        assert!(result.message.contains("aws-clawd-bot"));

        // Alias with explicit repo.
        let result = skill.execute("pipeline aws-clawd-bot", &ctx).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_unknown_project_surfaces_not_found() {
        let skill = PipelineSkill::new();
        let ctx = ctx_for("C1").await;
        let err = skill.execute("pipeline deploy mystery", &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_confirm_bad_token() {
        let skill = PipelineSkill::new();
        let ctx = ctx_for("C1").await;
        let err = skill.execute("confirm zzzzzzzz", &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let skill = PipelineSkill::new();
        let ctx = ctx_for("C1").await;
        let pending = skill
            .execute("pipeline deploy aws-clawd-bot", &ctx)
            .await
            .unwrap();
        let token = token_from(&pending);

        let cancelled = skill.execute(&format!("cancel {token}"), &ctx).await.unwrap();
        assert!(cancelled.success);
        let err = skill.execute(&format!("confirm {token}"), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_status_and_history() {
        let skill = PipelineSkill::new();
        let ctx = ctx_for("C1").await;

        let empty = skill.execute("pipeline status", &ctx).await.unwrap();
        assert!(empty.message.contains("No pipeline running"));
        assert!(empty.message.contains("No deployments"));

        let pending = skill
            .execute("pipeline deploy aws-clawd-bot", &ctx)
            .await
            .unwrap();
        let token = token_from(&pending);
        skill.execute(&format!("confirm {token}"), &ctx).await.unwrap();

        let status = skill.execute("deploy history", &ctx).await.unwrap();
        assert!(status.message.contains("aws-clawd-bot"));
        assert!(status.message.contains("ok"));
    }

    #[tokio::test]
    async fn test_rollback_flow() {
        let skill = PipelineSkill::new();
        let ctx = ctx_for("C1").await;

        // Nothing deployed yet.
        let err = skill
            .execute("pipeline rollback aws-clawd-bot", &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // Deploy, then roll back.
        let pending = skill
            .execute("pipeline deploy aws-clawd-bot", &ctx)
            .await
            .unwrap();
        let token = token_from(&pending);
        skill.execute(&format!("confirm {token}"), &ctx).await.unwrap();

        let pending = skill
            .execute("pipeline rollback aws-clawd-bot", &ctx)
            .await
            .unwrap();
        let token = token_from(&pending);
        let done = skill.execute(&format!("confirm {token}"), &ctx).await.unwrap();
        assert!(done.success);
        assert!(done.message.starts_with("Rollback Complete"));

        let history = ctx.services.orchestrator.history().recent(1);
        assert!(history[0].is_rollback);
    }

    #[tokio::test]
    async fn test_run_tests_only() {
        let skill = PipelineSkill::new();
        let ctx = ctx_for("C1").await;
        let result = skill.execute("pipeline test aws-clawd-bot", &ctx).await.unwrap();
        assert!(result.success);
        assert!(result.message.contains("Test [PASS]"));
    }

    #[test]
    fn test_format_outcome_failed_pipeline() {
        let outcome = PipelineOutcome {
            target: "aws-clawd-bot".into(),
            success: false,
            stages: vec![
                StageResult {
                    name: "test".into(),
                    status: StageStatus::Failed,
                    duration_ms: 900,
                    output: "2 failing".into(),
                },
                StageResult {
                    name: "deploy".into(),
                    status: StageStatus::Skipped,
                    duration_ms: 0,
                    output: "aborted (tests failed)".into(),
                },
                StageResult {
                    name: "verify".into(),
                    status: StageStatus::Skipped,
                    duration_ms: 0,
                    output: "aborted (tests failed)".into(),
                },
            ],
            url: None,
            total_duration_ms: 950,
            is_rollback: false,
        };
        let text = format_outcome(&outcome);
        assert!(text.starts_with("Pipeline Failed: aws-clawd-bot"));
        assert!(text.contains("Deploy [SKIP] - aborted (tests failed)"));
        assert!(text.contains("Verify [SKIP]"));
    }
}
