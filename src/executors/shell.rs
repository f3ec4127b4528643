// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Shell executor
//!
//! Executes stage scripts through a shell. The child is killed if the
//! execution future is dropped, which is how timeouts and cancellation
//! terminate it.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command as ProcessCommand;

use super::{resolve_globs, ExecutionContext, ExecutionOutput, Executor, ProducedArtifact};
use crate::errors::GantryError;
use crate::gate::parse_report;
use crate::pipeline::{Command, StageDefinition};

/// Shell executor
pub struct ShellExecutor;

impl ShellExecutor {
    /// Create a new shell executor
    pub fn new() -> Self {
        Self
    }

    /// `<stage>/<name>=<path>` per line, for scripts that consume inputs
    fn inputs_env(ctx: &ExecutionContext) -> String {
        ctx.inputs
            .iter()
            .map(|a| {
                format!(
                    "{}/{}={}",
                    a.stage_id,
                    a.name,
                    ctx.store.blob_path(a).display()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn collect_outputs(
        stage: &StageDefinition,
        working_dir: &Path,
    ) -> Result<Vec<ProducedArtifact>, GantryError> {
        let mut produced = Vec::new();

        for path in resolve_globs(&stage.id, &stage.outputs, working_dir)? {
            let bytes = tokio::fs::read(&path).await.map_err(|e| GantryError::FileReadError {
                path: path.clone(),
                error: e.to_string(),
            })?;
            let name = path
                .strip_prefix(working_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            produced.push(ProducedArtifact::new(name, bytes));
        }

        Ok(produced)
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(
        &self,
        stage: &StageDefinition,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, GantryError> {
        let Command::Shell { run, shell } = &stage.command else {
            return Err(GantryError::InvalidStage {
                stage: stage.id.clone(),
                reason: "Expected Shell command".to_string(),
            });
        };

        let mut cmd = ProcessCommand::new(shell);
        cmd.arg("-c").arg(run);
        cmd.current_dir(&ctx.working_dir);
        cmd.envs(&ctx.env);
        cmd.env("GANTRY_RUN_ID", ctx.run_id.to_string());
        cmd.env("GANTRY_STAGE_ID", &stage.id);
        cmd.env("GANTRY_SOURCE_REF", &ctx.event.source_ref);
        cmd.env("GANTRY_TRIGGER", ctx.event.trigger.to_string());
        cmd.env("GANTRY_INPUTS", Self::inputs_env(ctx));
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| GantryError::ToolExecutionFailed {
            tool: shell.clone(),
            error: e.to_string(),
            help: Some(format!("Shell '{}' may not be available", shell)),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            // Killed by a signal when there is no code
            let exit_code = output.status.code().unwrap_or(-1);
            return Ok(ExecutionOutput {
                exit_code,
                stdout,
                stderr,
                ..ExecutionOutput::default()
            });
        }

        let mut produced = Self::collect_outputs(stage, &ctx.working_dir).await?;
        let mut findings = Vec::new();

        if let Some(report) = &stage.report {
            let path = ctx.working_dir.join(report);
            let bytes = tokio::fs::read(&path).await.map_err(|_| GantryError::MissingOutput {
                stage: stage.id.clone(),
                pattern: report.display().to_string(),
            })?;
            findings = parse_report(&bytes)?;
            produced.push(ProducedArtifact::new(report.display().to_string(), bytes));
        }

        Ok(ExecutionOutput {
            exit_code: 0,
            stdout,
            stderr,
            produced,
            findings,
        })
    }

    /// Some shell exists; a stage's own `shell:` is checked by `validate_stage`
    async fn check_available(&self) -> bool {
        which::which("bash").is_ok() || which::which("sh").is_ok()
    }

    fn validate_stage(&self, stage: &StageDefinition) -> Result<(), GantryError> {
        let Command::Shell { run, shell } = &stage.command else {
            return Err(GantryError::InvalidStage {
                stage: stage.id.clone(),
                reason: "Not a Shell stage".to_string(),
            });
        };

        if run.trim().is_empty() {
            return Err(GantryError::InvalidStage {
                stage: stage.id.clone(),
                reason: "Shell command is empty".to_string(),
            });
        }

        if which::which(shell).is_err() {
            return Err(GantryError::ToolExecutionFailed {
                tool: shell.clone(),
                error: "not found in PATH".to_string(),
                help: Some(format!("Install {} or set `shell:` on stage '{}'", shell, stage.id)),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FilesystemArtifactStore;
    use crate::gate::Severity;
    use crate::pipeline::dag::tests::make_stage;
    use crate::pipeline::{RunId, TriggerEvent};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn shell_stage(id: &str, run: &str) -> StageDefinition {
        let mut stage = make_stage(id, &[]);
        stage.command = Command::shell(run);
        stage
    }

    fn context(dir: &TempDir) -> ExecutionContext {
        let store = FilesystemArtifactStore::new(dir.path().join(".gantry")).unwrap();
        ExecutionContext {
            run_id: RunId::new(),
            event: TriggerEvent::push("refs/heads/main"),
            working_dir: dir.path().to_path_buf(),
            env: HashMap::from([("APP_ENV".to_string(), "ci".to_string())]),
            inputs: vec![],
            store: Arc::new(store),
        }
    }

    #[test]
    fn test_validate_shell_stage() {
        let executor = ShellExecutor::new();
        assert!(executor.validate_stage(&shell_stage("test", "echo hello")).is_ok());
        assert!(executor.validate_stage(&shell_stage("test", "  ")).is_err());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let dir = TempDir::new().unwrap();
        let stage = shell_stage("test", "echo $APP_ENV $GANTRY_STAGE_ID $GANTRY_TRIGGER");

        let output = ShellExecutor::new()
            .execute(&stage, &context(&dir))
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "ci test push");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_output() {
        let dir = TempDir::new().unwrap();
        let stage = shell_stage("test", "echo broken >&2; exit 3");

        let output = ShellExecutor::new()
            .execute(&stage, &context(&dir))
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(output.stderr.contains("broken"));
    }

    #[tokio::test]
    async fn test_outputs_and_report_are_collected() {
        let dir = TempDir::new().unwrap();
        let mut stage = shell_stage(
            "scan",
            "mkdir -p target && echo jar > target/app.jar && \
             echo '[{\"severity\":\"HIGH\",\"id\":\"CVE-1\"}]' > report.json",
        );
        stage.outputs = vec!["target/*.jar".into()];
        stage.report = Some("report.json".into());

        let output = ShellExecutor::new()
            .execute(&stage, &context(&dir))
            .await
            .unwrap();

        let names: Vec<_> = output.produced.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["target/app.jar", "report.json"]);
        assert_eq!(output.findings[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn test_missing_report_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut stage = shell_stage("scan", "true");
        stage.report = Some("report.json".into());

        let result = ShellExecutor::new().execute(&stage, &context(&dir)).await;
        assert!(matches!(result, Err(GantryError::MissingOutput { .. })));
    }
}
