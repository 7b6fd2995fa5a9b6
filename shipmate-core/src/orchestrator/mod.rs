//! Orchestrator — multi-stage pipelines (test, deploy, verify) against
//! named targets, with whitelisting, confirmation, rollback, single-flight,
//! and a full audit trail.
//!
//! The state machine per target:
//!
//! ```text
//! idle -> running ->
//!     test passed   -> deploy running ->
//!         deploy passed -> verify running ->
//!             verify passed -> complete
//!             verify failed -> complete (success with warning)
//!         deploy failed -> aborted (verify skipped)
//!     test failed   -> aborted (deploy and verify skipped)
//! ```
//!
//! Verify failure is deliberately non-fatal: health endpoints are
//! unreliable in the first seconds after a deploy, and a deploy that
//! landed should not read as a failure because of a slow warm-up.
//!
//! The orchestrator never spawns processes itself; everything goes through
//! the [`SubprocessAdapter`], which is the seam dev mode and tests
//! substitute.

mod history;

pub use history::{DeploymentHistory, DeploymentRecord};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::adapters::{CommandOutput, SubprocessAdapter};
use crate::audit::{AuditLog, AuditStatus};
use crate::config::{OrchestratorConfig, WhitelistEntry};
use crate::confirm::ConfirmationBroker;
use crate::error::{ConfirmError, OrchestratorError, ShipmateError};
use crate::sanitize;

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    Skipped,
    Warning,
}

impl StageStatus {
    /// Short tag for chat rendering.
    pub fn tag(&self) -> &'static str {
        match self {
            StageStatus::Passed => "PASS",
            StageStatus::Failed => "FAIL",
            StageStatus::Skipped => "SKIP",
            StageStatus::Warning => "WARN",
        }
    }
}

/// One executed (or skipped) stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    /// ANSI-stripped, head+tail bounded output for chat delivery.
    pub output: String,
}

impl StageResult {
    fn skipped(name: &str, reason: &str) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Skipped,
            duration_ms: 0,
            output: reason.into(),
        }
    }
}

/// The result of a full pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub target: String,
    pub success: bool,
    pub stages: Vec<StageResult>,
    pub url: Option<String>,
    pub total_duration_ms: u64,
    pub is_rollback: bool,
}

/// Probes a health endpoint. The HTTP implementation is the default; tests
/// substitute a stub.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Returns the HTTP status code, or an error string.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, String>;
}

/// reqwest-backed health checker.
#[derive(Default)]
pub struct HttpHealthChecker {
    client: reqwest::Client,
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, String> {
        self.client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map(|r| r.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

/// A confirmation handed back to the user for a parked action.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub token: String,
    pub action: String,
    pub target: String,
    pub expires_in_secs: u64,
}

/// Removes the target from the active set when a pipeline ends, on every
/// exit path.
struct FlightGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    target: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .expect("active set lock poisoned")
            .remove(&self.target);
    }
}

/// The deployment orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    subprocess: Arc<dyn SubprocessAdapter>,
    confirm: Arc<ConfirmationBroker>,
    audit: Arc<AuditLog>,
    health: Arc<dyn HealthChecker>,
    history: DeploymentHistory,
    active: Mutex<HashSet<String>>,
    preview_url: Regex,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        subprocess: Arc<dyn SubprocessAdapter>,
        confirm: Arc<ConfirmationBroker>,
        audit: Arc<AuditLog>,
        health: Arc<dyn HealthChecker>,
    ) -> Self {
        Self {
            config,
            subprocess,
            confirm,
            audit,
            health,
            history: DeploymentHistory::default(),
            active: Mutex::new(HashSet::new()),
            preview_url: Regex::new(r"https://[\w.-]+\.vercel\.app[\w/.-]*")
                .expect("preview url pattern is static"),
        }
    }

    /// The deployment history ring.
    pub fn history(&self) -> &DeploymentHistory {
        &self.history
    }

    /// Targets with a pipeline currently in flight.
    pub fn active_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .active
            .lock()
            .expect("active set lock poisoned")
            .iter()
            .cloned()
            .collect();
        targets.sort();
        targets
    }

    /// Park a deploy behind a confirmation token. Deploys always confirm.
    pub fn request_deploy(
        &self,
        target: &str,
        requested_by: &str,
    ) -> Result<PendingAction, ShipmateError> {
        self.project_path(target)?;
        self.ensure_idle(target)?;
        Ok(self.park("deploy", target, requested_by))
    }

    /// Park a rollback behind a confirmation token. Requires a prior
    /// successful deploy in history.
    pub fn request_rollback(
        &self,
        target: &str,
        requested_by: &str,
    ) -> Result<PendingAction, ShipmateError> {
        self.project_path(target)?;
        self.ensure_idle(target)?;
        if self.history.latest_successful_deploy(target).is_none() {
            return Err(OrchestratorError::NothingToRollback {
                target: target.to_string(),
            }
            .into());
        }
        Ok(self.park("rollback", target, requested_by))
    }

    fn park(&self, action: &str, target: &str, requested_by: &str) -> PendingAction {
        let ttl = self.config.confirmation_ttl_secs;
        let token = self.confirm.create_pending(
            action,
            serde_json::json!({"action": action, "target": target}),
            ChronoDuration::seconds(ttl as i64),
            requested_by,
        );
        self.audit.record(
            format!("{action}.requested"),
            target,
            AuditStatus::Success,
            requested_by,
            serde_json::json!({"token": token}),
        );
        PendingAction {
            token,
            action: action.to_string(),
            target: target.to_string(),
            expires_in_secs: ttl,
        }
    }

    /// Redeem a token and run the parked action.
    pub async fn confirm_and_run(
        &self,
        token: &str,
        actor: &str,
    ) -> Result<PipelineOutcome, ShipmateError> {
        let pending = self.confirm.redeem(token, actor)?;
        let target = pending.payload["target"]
            .as_str()
            .ok_or(ConfirmError::NotFound)?
            .to_string();
        match pending.payload["action"].as_str() {
            Some("deploy") => self.run_pipeline(&target, actor).await,
            Some("rollback") => self.run_rollback(&target, actor).await,
            Some("command") => {
                let command: Vec<String> =
                    serde_json::from_value(pending.payload["command"].clone())
                        .map_err(|_| ConfirmError::NotFound)?;
                self.run_confirmed_command(&target, &command, actor).await
            }
            _ => Err(ConfirmError::NotFound.into()),
        }
    }

    /// Run a previously parked ad-hoc command, presented as a one-stage
    /// pipeline outcome so the caller formats every confirmation the same
    /// way.
    async fn run_confirmed_command(
        &self,
        target: &str,
        command: &[String],
        requested_by: &str,
    ) -> Result<PipelineOutcome, ShipmateError> {
        let project_dir = self.project_path(target)?;
        let _guard = self.claim_flight(target)?;
        let started = Instant::now();
        let stage_name = command.first().cloned().unwrap_or_default();
        let stage = self
            .run_stage(&stage_name, command, &project_dir, target, requested_by)
            .await?;
        let success = stage.status == StageStatus::Passed;
        Ok(PipelineOutcome {
            target: target.to_string(),
            success,
            stages: vec![stage],
            url: None,
            total_duration_ms: (started.elapsed().as_millis() as u64).max(1),
            is_rollback: false,
        })
    }

    /// Discard a parked action.
    pub fn cancel_pending(&self, token: &str) -> bool {
        self.confirm.cancel(token).is_some()
    }

    /// Run the full test -> deploy -> verify pipeline. Single-flight per
    /// target; a concurrent submission gets a structured busy error.
    pub async fn run_pipeline(
        &self,
        target: &str,
        requested_by: &str,
    ) -> Result<PipelineOutcome, ShipmateError> {
        let project_dir = self.project_path(target)?;
        let _guard = self.claim_flight(target)?;
        let started = Instant::now();
        self.audit.record(
            "pipeline.start",
            target,
            AuditStatus::Success,
            requested_by,
            serde_json::Value::Null,
        );

        let mut stages = Vec::with_capacity(3);

        // Stage: test.
        let test = self
            .run_stage("test", &self.config.test_command, &project_dir, target, requested_by)
            .await?;
        let tests_passed = test.status == StageStatus::Passed;
        stages.push(test);

        if !tests_passed {
            stages.push(StageResult::skipped("deploy", "aborted (tests failed)"));
            stages.push(StageResult::skipped("verify", "aborted (tests failed)"));
            return Ok(self.finish(
                target,
                requested_by,
                stages,
                Some(false),
                false,
                false,
                None,
                started,
                false,
            ));
        }

        // Stage: deploy.
        let deploy = self
            .run_stage("deploy", &self.config.deploy_command, &project_dir, target, requested_by)
            .await?;
        let deploy_passed = deploy.status == StageStatus::Passed;
        let deploy_output = deploy.output.clone();
        stages.push(deploy);

        if !deploy_passed {
            stages.push(StageResult::skipped("verify", "aborted (deploy failed)"));
            return Ok(self.finish(
                target,
                requested_by,
                stages,
                Some(true),
                false,
                false,
                None,
                started,
                false,
            ));
        }

        // Stage: verify. Failure is a warning, not a pipeline failure.
        let (verify, url) = self.verify_stage(target, &deploy_output).await;
        let verify_warning = verify.status == StageStatus::Warning;
        stages.push(verify);

        Ok(self.finish(
            target,
            requested_by,
            stages,
            Some(true),
            true,
            verify_warning,
            url,
            started,
            false,
        ))
    }

    /// Roll a target back to the revision before the latest successful
    /// deploy: check out the prior revision, re-run the deploy stage, and
    /// if that redeploy fails restore the tree to where it was.
    pub async fn run_rollback(
        &self,
        target: &str,
        requested_by: &str,
    ) -> Result<PipelineOutcome, ShipmateError> {
        let project_dir = self.project_path(target)?;
        if self.history.latest_successful_deploy(target).is_none() {
            return Err(OrchestratorError::NothingToRollback {
                target: target.to_string(),
            }
            .into());
        }
        let _guard = self.claim_flight(target)?;
        let started = Instant::now();
        self.audit.record(
            "rollback.start",
            target,
            AuditStatus::Success,
            requested_by,
            serde_json::Value::Null,
        );

        let mut stages = Vec::with_capacity(3);

        let checkout_cmd = vec!["git".to_string(), "checkout".to_string(), "HEAD~1".to_string()];
        let checkout = self
            .run_stage("checkout", &checkout_cmd, &project_dir, target, requested_by)
            .await?;
        let checkout_passed = checkout.status == StageStatus::Passed;
        stages.push(checkout);

        if !checkout_passed {
            stages.push(StageResult::skipped("deploy", "aborted (checkout failed)"));
            stages.push(StageResult::skipped("verify", "aborted (checkout failed)"));
            return Ok(self.finish(
                target, requested_by, stages, None, false, false, None, started, true,
            ));
        }

        let deploy = self
            .run_stage("deploy", &self.config.deploy_command, &project_dir, target, requested_by)
            .await?;
        let deploy_passed = deploy.status == StageStatus::Passed;
        let deploy_output = deploy.output.clone();
        stages.push(deploy);

        if !deploy_passed {
            // The redeploy failed: restore the working tree.
            let restore_cmd = vec!["git".to_string(), "checkout".to_string(), "-".to_string()];
            let restore = self
                .run_stage("restore", &restore_cmd, &project_dir, target, requested_by)
                .await?;
            stages.push(restore);
            return Ok(self.finish(
                target, requested_by, stages, None, false, false, None, started, true,
            ));
        }

        let (verify, url) = self.verify_stage(target, &deploy_output).await;
        let verify_warning = verify.status == StageStatus::Warning;
        stages.push(verify);

        Ok(self.finish(
            target,
            requested_by,
            stages,
            None,
            true,
            verify_warning,
            url,
            started,
            true,
        ))
    }

    /// Run only the test stage against a project. No confirmation needed;
    /// tests are read-only from the service's point of view.
    pub async fn run_tests(
        &self,
        target: &str,
        requested_by: &str,
    ) -> Result<StageResult, ShipmateError> {
        let project_dir = self.project_path(target)?;
        let _guard = self.claim_flight(target)?;
        self.run_stage("test", &self.config.test_command, &project_dir, target, requested_by)
            .await
    }

    /// Run one whitelisted ad-hoc command against a project. Commands
    /// flagged `requires_confirmation` are parked instead.
    pub async fn execute_command(
        &self,
        target: &str,
        command: &[String],
        requested_by: &str,
    ) -> Result<CommandOutput, ShipmateError> {
        let project_dir = self.project_path(target)?;
        let entry = self.validate_command(command)?;
        if entry.requires_confirmation {
            let ttl = self.config.confirmation_ttl_secs;
            let token = self.confirm.create_pending(
                "command",
                serde_json::json!({"action": "command", "target": target, "command": command}),
                ChronoDuration::seconds(ttl as i64),
                requested_by,
            );
            self.audit.record(
                "command.requested",
                target,
                AuditStatus::Success,
                requested_by,
                serde_json::json!({"token": token, "command": command.join(" ")}),
            );
            return Err(OrchestratorError::ConfirmationRequired { token }.into());
        }
        let (program, args) = command.split_first().expect("validated non-empty");
        let output = self
            .subprocess
            .run(
                program,
                args,
                &project_dir,
                Duration::from_secs(entry.timeout_secs),
                &Default::default(),
            )
            .await?;
        self.audit.record(
            "command.run",
            target,
            if output.success { AuditStatus::Success } else { AuditStatus::Failed },
            requested_by,
            serde_json::json!({
                "command": command.join(" "),
                "output": sanitize::truncate_head_tail(
                    &sanitize::strip_ansi(output.display_output()),
                    self.config.output_audit_limit,
                ),
            }),
        );
        Ok(output)
    }

    // -- internals ---------------------------------------------------------

    fn project_path(&self, target: &str) -> Result<std::path::PathBuf, ShipmateError> {
        self.config
            .projects
            .get(target)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownProject {
                project: target.to_string(),
            }
            .into())
    }

    fn ensure_idle(&self, target: &str) -> Result<(), ShipmateError> {
        if self.active.lock().expect("active set lock poisoned").contains(target) {
            return Err(OrchestratorError::PipelineBusy {
                target: target.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn claim_flight<'a>(&'a self, target: &str) -> Result<FlightGuard<'a>, ShipmateError> {
        let mut active = self.active.lock().expect("active set lock poisoned");
        if !active.insert(target.to_string()) {
            return Err(OrchestratorError::PipelineBusy {
                target: target.to_string(),
            }
            .into());
        }
        Ok(FlightGuard {
            active: &self.active,
            target: target.to_string(),
        })
    }

    fn validate_command<'a>(&'a self, command: &[String]) -> Result<&'a WhitelistEntry, ShipmateError> {
        let Some(program) = command.first() else {
            return Err(OrchestratorError::CommandNotAllowed {
                command: String::new(),
            }
            .into());
        };
        let entry = self.config.whitelist.get(program).ok_or_else(|| {
            OrchestratorError::CommandNotAllowed {
                command: program.clone(),
            }
        })?;
        if let Some(bad) = sanitize::first_unsafe_argument(&command[1..]) {
            warn!(program, argument = bad, "rejected unsafe argument");
            return Err(OrchestratorError::ArgumentRejected {
                command: program.clone(),
            }
            .into());
        }
        Ok(entry)
    }

    async fn run_stage(
        &self,
        stage: &str,
        command: &[String],
        project_dir: &std::path::Path,
        target: &str,
        requested_by: &str,
    ) -> Result<StageResult, ShipmateError> {
        let entry = self.validate_command(command)?;
        let (program, args) = command.split_first().expect("validated non-empty");
        let started = Instant::now();
        let output = self
            .subprocess
            .run(
                program,
                args,
                project_dir,
                Duration::from_secs(entry.timeout_secs),
                &Default::default(),
            )
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;
        let status = if output.success { StageStatus::Passed } else { StageStatus::Failed };

        let clean = sanitize::strip_ansi(output.display_output());
        self.audit.record(
            format!("stage.{stage}"),
            target,
            if output.success { AuditStatus::Success } else { AuditStatus::Failed },
            requested_by,
            serde_json::json!({
                "command": command.join(" "),
                "duration_ms": duration_ms,
                "killed": output.killed,
                "simulated": output.simulated,
                "output": sanitize::truncate_head_tail(&clean, self.config.output_audit_limit),
            }),
        );
        info!(stage, target, status = status.tag(), duration_ms, "stage finished");

        Ok(StageResult {
            name: stage.to_string(),
            status,
            duration_ms,
            output: sanitize::truncate_head_tail(&clean, self.config.output_chat_limit),
        })
    }

    /// Probe the configured health endpoint, or a preview URL extracted
    /// from the deploy output (after a short settle delay). 2xx within the
    /// stage timeout is a pass; anything else is a warning.
    async fn verify_stage(&self, target: &str, deploy_output: &str) -> (StageResult, Option<String>) {
        let timeout = Duration::from_secs(self.config.verify_timeout_secs);
        let started = Instant::now();

        let (url, settle) = match self.config.health_urls.get(target) {
            Some(url) => (Some(url.clone()), false),
            None => (
                self.preview_url
                    .find(deploy_output)
                    .map(|m| m.as_str().to_string()),
                true,
            ),
        };

        let Some(url) = url else {
            let result = StageResult {
                name: "verify".into(),
                status: StageStatus::Warning,
                duration_ms: 0,
                output: "no health endpoint configured".into(),
            };
            return (result, None);
        };

        if settle {
            tokio::time::sleep(Duration::from_secs(self.config.preview_settle_secs)).await;
        }

        let (status, output) = match self.health.probe(&url, timeout).await {
            Ok(code) if (200..300).contains(&code) => {
                (StageStatus::Passed, format!("{url} -> {code}"))
            }
            Ok(code) => (StageStatus::Warning, format!("{url} -> {code}")),
            Err(e) => (StageStatus::Warning, format!("{url} unreachable: {e}")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        self.audit.record(
            "stage.verify",
            target,
            if status == StageStatus::Passed { AuditStatus::Success } else { AuditStatus::Failed },
            "orchestrator",
            serde_json::json!({"url": url, "duration_ms": duration_ms, "output": output}),
        );
        (
            StageResult {
                name: "verify".into(),
                status,
                duration_ms,
                output,
            },
            Some(url),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        target: &str,
        requested_by: &str,
        stages: Vec<StageResult>,
        tests_passed: Option<bool>,
        deploy_success: bool,
        verify_warning: bool,
        url: Option<String>,
        started: Instant,
        is_rollback: bool,
    ) -> PipelineOutcome {
        // Clocks can round a simulated pipeline down to zero; report at
        // least one millisecond of wall time.
        let total_duration_ms = (started.elapsed().as_millis() as u64).max(1);
        let success = deploy_success;
        self.history.push(DeploymentRecord {
            timestamp: Utc::now(),
            target: target.to_string(),
            tests_passed,
            deploy_success,
            verify_warning,
            is_rollback,
            duration_ms: total_duration_ms,
            url: url.clone(),
            requested_by: requested_by.to_string(),
        });
        self.audit.record(
            if is_rollback { "rollback.finish" } else { "pipeline.finish" },
            target,
            if success { AuditStatus::Success } else { AuditStatus::Failed },
            requested_by,
            serde_json::json!({"duration_ms": total_duration_ms, "url": url}),
        );
        PipelineOutcome {
            target: target.to_string(),
            success,
            stages,
            url,
            total_duration_ms,
            is_rollback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    /// Scriptable subprocess: maps a command head (or head+first arg) to
    /// success/failure and records every invocation.
    struct ScriptedSubprocess {
        outcomes: Mutex<HashMap<String, (bool, String)>>,
        calls: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedSubprocess {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn script(&self, key: &str, success: bool, output: &str) {
            self.outcomes
                .lock()
                .unwrap()
                .insert(key.to_string(), (success, output.to_string()));
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SubprocessAdapter for ScriptedSubprocess {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            _cwd: &Path,
            _timeout: Duration,
            _env: &HashMap<String, String>,
        ) -> Result<CommandOutput, AdapterError> {
            let line = format!("{program} {}", args.join(" ")).trim().to_string();
            self.calls.lock().unwrap().push(line.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let (success, output) = self
                .outcomes
                .lock()
                .unwrap()
                .get(&line)
                .cloned()
                .unwrap_or((true, format!("ran: {line}")));
            Ok(CommandOutput {
                success,
                stdout: output,
                stderr: String::new(),
                killed: false,
                simulated: false,
            })
        }
    }

    /// Health checker with a fixed status code.
    struct FixedHealth(u16);

    #[async_trait]
    impl HealthChecker for FixedHealth {
        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, String> {
            Ok(self.0)
        }
    }

    fn config() -> OrchestratorConfig {
        let mut cfg = OrchestratorConfig::default();
        cfg.projects.insert("aws-clawd-bot".into(), PathBuf::from("/srv/aws-clawd-bot"));
        cfg.health_urls
            .insert("aws-clawd-bot".into(), "https://bot.example.com/health".into());
        cfg.preview_settle_secs = 0;
        cfg
    }

    fn orchestrator_with(
        subprocess: Arc<ScriptedSubprocess>,
        health_code: u16,
    ) -> Orchestrator {
        Orchestrator::new(
            config(),
            subprocess,
            Arc::new(ConfirmationBroker::new()),
            Arc::new(AuditLog::default()),
            Arc::new(FixedHealth(health_code)),
        )
    }

    #[tokio::test]
    async fn test_happy_path_all_stages_pass() {
        let sub = Arc::new(ScriptedSubprocess::new());
        sub.script("npm test", true, "12 passing");
        sub.script("npm run deploy", true, "deployed");
        let orch = orchestrator_with(sub.clone(), 200);

        let outcome = orch.run_pipeline("aws-clawd-bot", "u1").await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.is_rollback);
        assert_eq!(outcome.stages.len(), 3);
        assert!(outcome.stages.iter().all(|s| s.status == StageStatus::Passed));
        assert_eq!(outcome.url.as_deref(), Some("https://bot.example.com/health"));

        let record = &orch.history().recent(1)[0];
        assert!(record.deploy_success);
        assert!(!record.is_rollback);
        assert_eq!(record.tests_passed, Some(true));
    }

    #[tokio::test]
    async fn test_test_failure_skips_deploy_and_verify() {
        let sub = Arc::new(ScriptedSubprocess::new());
        sub.script("npm test", false, "2 failing");
        let orch = orchestrator_with(sub.clone(), 200);

        let outcome = orch.run_pipeline("aws-clawd-bot", "u1").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.stages[0].status, StageStatus::Failed);
        assert_eq!(outcome.stages[1].status, StageStatus::Skipped);
        assert_eq!(outcome.stages[2].status, StageStatus::Skipped);
        // Deploy never executed.
        assert_eq!(sub.calls(), vec!["npm test"]);

        let record = &orch.history().recent(1)[0];
        assert_eq!(record.tests_passed, Some(false));
        assert!(!record.deploy_success);
    }

    #[tokio::test]
    async fn test_deploy_failure_skips_verify() {
        let sub = Arc::new(ScriptedSubprocess::new());
        sub.script("npm run deploy", false, "out of quota");
        let orch = orchestrator_with(sub.clone(), 200);

        let outcome = orch.run_pipeline("aws-clawd-bot", "u1").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.stages[1].status, StageStatus::Failed);
        assert_eq!(outcome.stages[2].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_verify_failure_is_nonfatal_warning() {
        let sub = Arc::new(ScriptedSubprocess::new());
        let orch = orchestrator_with(sub, 503);

        let outcome = orch.run_pipeline("aws-clawd-bot", "u1").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.stages[2].status, StageStatus::Warning);

        let record = &orch.history().recent(1)[0];
        assert!(record.deploy_success);
        assert!(record.verify_warning);
    }

    #[tokio::test]
    async fn test_single_flight_conflict() {
        let mut slow = ScriptedSubprocess::new();
        slow.delay = Duration::from_millis(300);
        let orch = Arc::new(orchestrator_with(Arc::new(slow), 200));

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run_pipeline("aws-clawd-bot", "u1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = orch.run_pipeline("aws-clawd-bot", "u2").await;
        assert!(matches!(
            second.unwrap_err(),
            ShipmateError::Orchestrator(OrchestratorError::PipelineBusy { .. })
        ));
        assert!(first.await.unwrap().unwrap().success);
        // Flight guard released: a new run is accepted.
        assert!(orch.run_pipeline("aws-clawd-bot", "u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_project_rejected() {
        let orch = orchestrator_with(Arc::new(ScriptedSubprocess::new()), 200);
        assert!(matches!(
            orch.run_pipeline("mystery", "u1").await.unwrap_err(),
            ShipmateError::Orchestrator(OrchestratorError::UnknownProject { .. })
        ));
    }

    #[tokio::test]
    async fn test_whitelist_rejects_unknown_command() {
        let orch = orchestrator_with(Arc::new(ScriptedSubprocess::new()), 200);
        let err = orch
            .execute_command("aws-clawd-bot", &["rm".into(), "-rf".into()], "u1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShipmateError::Orchestrator(OrchestratorError::CommandNotAllowed { .. })
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_whitelist_rejects_unsafe_argument() {
        let orch = orchestrator_with(Arc::new(ScriptedSubprocess::new()), 200);
        let err = orch
            .execute_command(
                "aws-clawd-bot",
                &["git".into(), "checkout".into(), "$(reboot)".into()],
                "u1",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShipmateError::Orchestrator(OrchestratorError::ArgumentRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_confirmation_flow_deploy() {
        let sub = Arc::new(ScriptedSubprocess::new());
        let orch = orchestrator_with(sub, 200);

        let pending = orch.request_deploy("aws-clawd-bot", "u1").unwrap();
        assert_eq!(pending.action, "deploy");

        let outcome = orch.confirm_and_run(&pending.token, "u1").await.unwrap();
        assert!(outcome.success);

        // Token is consumed.
        assert!(matches!(
            orch.confirm_and_run(&pending.token, "u1").await.unwrap_err(),
            ShipmateError::Confirm(ConfirmError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_rollback_checks_out_prior_revision_then_redeploys() {
        let sub = Arc::new(ScriptedSubprocess::new());
        let orch = orchestrator_with(sub.clone(), 200);

        // Nothing to roll back yet.
        assert!(matches!(
            orch.request_rollback("aws-clawd-bot", "u1").unwrap_err(),
            ShipmateError::Orchestrator(OrchestratorError::NothingToRollback { .. })
        ));

        orch.run_pipeline("aws-clawd-bot", "u1").await.unwrap();
        let pending = orch.request_rollback("aws-clawd-bot", "u1").unwrap();
        let outcome = orch.confirm_and_run(&pending.token, "u1").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.is_rollback);

        let calls = sub.calls();
        let checkout_pos = calls.iter().position(|c| c == "git checkout HEAD~1").unwrap();
        let redeploy_pos = calls.iter().rposition(|c| c == "npm run deploy").unwrap();
        assert!(checkout_pos < redeploy_pos);

        let record = &orch.history().recent(1)[0];
        assert!(record.is_rollback);
    }

    #[tokio::test]
    async fn test_rollback_redeploy_failure_restores_tree() {
        let sub = Arc::new(ScriptedSubprocess::new());
        let orch = orchestrator_with(sub.clone(), 200);
        orch.run_pipeline("aws-clawd-bot", "u1").await.unwrap();

        sub.script("npm run deploy", false, "quota exceeded");
        let pending = orch.request_rollback("aws-clawd-bot", "u1").unwrap();
        let outcome = orch.confirm_and_run(&pending.token, "u1").await.unwrap();
        assert!(!outcome.success);
        assert!(sub.calls().iter().any(|c| c == "git checkout -"));
    }

    #[tokio::test]
    async fn test_preview_url_extraction_when_no_health_url() {
        let sub = Arc::new(ScriptedSubprocess::new());
        sub.script(
            "npm run deploy",
            true,
            "Deployed to https://bot-abc123.vercel.app in 9s",
        );
        let mut cfg = config();
        cfg.health_urls.clear();
        let orch = Orchestrator::new(
            cfg,
            sub,
            Arc::new(ConfirmationBroker::new()),
            Arc::new(AuditLog::default()),
            Arc::new(FixedHealth(200)),
        );

        let outcome = orch.run_pipeline("aws-clawd-bot", "u1").await.unwrap();
        assert_eq!(outcome.url.as_deref(), Some("https://bot-abc123.vercel.app"));
        assert_eq!(outcome.stages[2].status, StageStatus::Passed);
    }
}
