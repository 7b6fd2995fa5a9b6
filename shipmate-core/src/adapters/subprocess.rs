//! Subprocess adapters: the real thing, and the dev-mode double.
//!
//! The orchestrator never spawns processes itself; it sees only the
//! [`SubprocessAdapter`] trait. Off the deployment host the wiring
//! substitutes [`SimulatedProcessAdapter`], which reports what it *would*
//! run — the rest of the pipeline proceeds identically, which is what
//! makes pipelines testable off-host.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CommandOutput, SubprocessAdapter};
use crate::error::AdapterError;

/// Spawns real processes with a hard deadline. Arguments are passed as an
/// argv vector, never through a shell.
#[derive(Debug, Default)]
pub struct LocalProcessAdapter;

impl LocalProcessAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Whether this machine looks like the deployment host. The wiring
    /// uses this probe to decide between real and simulated execution.
    pub fn on_deploy_host() -> bool {
        cfg!(target_os = "linux")
    }
}

#[async_trait]
impl SubprocessAdapter for LocalProcessAdapter {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
        env: &HashMap<String, String>,
    ) -> Result<CommandOutput, AdapterError> {
        debug!(program, ?args, cwd = %cwd.display(), "spawning subprocess");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = cmd.output();
        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                killed: false,
                simulated: false,
            }),
            Ok(Err(e)) => Err(AdapterError::Request {
                adapter: "subprocess".into(),
                message: format!("failed to spawn {program}: {e}"),
            }),
            Err(_) => {
                warn!(program, timeout_secs = timeout.as_secs(), "subprocess killed at deadline");
                Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("killed after {}s", timeout.as_secs()),
                    killed: true,
                    simulated: false,
                })
            }
        }
    }
}

/// Dev-mode double: pretends every command succeeds and reports what it
/// would have executed.
#[derive(Debug, Default)]
pub struct SimulatedProcessAdapter;

impl SimulatedProcessAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SubprocessAdapter for SimulatedProcessAdapter {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        _timeout: Duration,
        _env: &HashMap<String, String>,
    ) -> Result<CommandOutput, AdapterError> {
        let line = format!(
            "[DEV MODE] would execute: {} {} (in {})",
            program,
            args.join(" "),
            cwd.display()
        );
        debug!("{line}");
        Ok(CommandOutput {
            success: true,
            stdout: line,
            stderr: String::new(),
            killed: false,
            simulated: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_run_reports_command() {
        let adapter = SimulatedProcessAdapter::new();
        let out = adapter
            .run(
                "npm",
                &["test".to_string()],
                Path::new("/srv/app"),
                Duration::from_secs(1),
                &HashMap::new(),
            )
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.simulated);
        assert!(out.stdout.contains("[DEV MODE] would execute: npm test"));
        assert!(out.stdout.contains("/srv/app"));
    }

    #[tokio::test]
    async fn test_local_run_captures_output() {
        let adapter = LocalProcessAdapter::new();
        let out = adapter
            .run(
                "echo",
                &["hello".to_string()],
                Path::new("."),
                Duration::from_secs(5),
                &HashMap::new(),
            )
            .await
            .unwrap();
        assert!(out.success);
        assert!(!out.simulated);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_local_run_nonzero_exit() {
        let adapter = LocalProcessAdapter::new();
        let out = adapter
            .run(
                "sh",
                &["-c".to_string(), "exit 3".to_string()],
                Path::new("."),
                Duration::from_secs(5),
                &HashMap::new(),
            )
            .await
            .unwrap();
        assert!(!out.success);
        assert!(!out.killed);
    }

    #[tokio::test]
    async fn test_local_run_deadline_kills() {
        let adapter = LocalProcessAdapter::new();
        let out = adapter
            .run(
                "sleep",
                &["5".to_string()],
                Path::new("."),
                Duration::from_millis(100),
                &HashMap::new(),
            )
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.killed);
        assert!(out.stderr.contains("killed"));
    }

    #[tokio::test]
    async fn test_local_run_missing_program() {
        let adapter = LocalProcessAdapter::new();
        let err = adapter
            .run(
                "definitely-not-a-real-binary-xyz",
                &[],
                Path::new("."),
                Duration::from_secs(1),
                &HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Request { .. }));
    }
}
