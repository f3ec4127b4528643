// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Stage runner
//!
//! Wraps an executor with the per-stage timeout, the retry loop and
//! cancellation. Logs of every attempt and the outputs of the successful
//! attempt are in the artifact store before `run` returns.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::{ExecutionContext, ExecutionOutput, ExecutionStatus, ExecutorRegistry, StageResult};
use crate::artifacts::{ArtifactRef, ArtifactStore};
use crate::errors::GantryError;
use crate::pipeline::{AttemptRecord, FailureReason, StageDefinition};

/// Progress reported while a stage is executing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageProgress {
    /// An attempt is starting (1-based)
    Attempt { attempt: u32 },
    /// An attempt failed and the next one starts after `delay`
    Retrying {
        attempt: u32,
        delay: Duration,
        reason: FailureReason,
    },
}

/// Runs stages through the registered executors
#[derive(Clone)]
pub struct StageRunner {
    registry: ExecutorRegistry,
    store: Arc<dyn ArtifactStore>,
}

enum AttemptOutcome {
    Finished(ExecutionOutput),
    Failed(FailureReason, Option<ExecutionOutput>),
    Cancelled,
}

/// Resolves once cancellation has been requested. Never resolves if the
/// sender is gone without having cancelled.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn classify(err: &GantryError) -> FailureReason {
    match err {
        GantryError::TransientInfra { .. } => FailureReason::TransientInfra {
            message: err.to_string(),
        },
        _ => FailureReason::Error {
            message: err.to_string(),
        },
    }
}

impl StageRunner {
    pub fn new(registry: ExecutorRegistry, store: Arc<dyn ArtifactStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn ArtifactStore> {
        self.store.clone()
    }

    /// Run a stage to a terminal result.
    ///
    /// Retryable failures are retried up to the stage's `max_attempts`.
    /// Executor errors never escape; they become the result's failure.
    pub async fn run(
        &self,
        stage: &StageDefinition,
        timeout: Duration,
        ctx: &ExecutionContext,
        mut cancel: watch::Receiver<bool>,
        on_progress: &(dyn Fn(StageProgress) + Send + Sync),
    ) -> StageResult {
        let started = Instant::now();
        let mut result = StageResult::without_attempts(&stage.id, ExecutionStatus::Cancelled);

        let Some(executor) = self.registry.get(stage.command_name()) else {
            let err = GantryError::ExecutorNotFound {
                command: stage.command_name().to_string(),
            };
            result.status = ExecutionStatus::Failed(classify(&err));
            return result;
        };

        let max_attempts = stage.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if *cancel.borrow() {
                break;
            }

            on_progress(StageProgress::Attempt { attempt });
            tracing::debug!(stage = %stage.id, attempt, "Starting attempt");

            let attempt_started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => AttemptOutcome::Cancelled,
                executed = tokio::time::timeout(timeout, executor.execute(stage, ctx)) => {
                    match executed {
                        Err(_) => AttemptOutcome::Failed(
                            FailureReason::Timeout { seconds: timeout.as_secs() },
                            None,
                        ),
                        Ok(Err(err)) => AttemptOutcome::Failed(classify(&err), None),
                        Ok(Ok(output)) if output.exit_code == 0 => AttemptOutcome::Finished(output),
                        Ok(Ok(output)) => AttemptOutcome::Failed(
                            FailureReason::NonZeroExit { exit_code: output.exit_code },
                            Some(output),
                        ),
                    }
                }
            };
            let elapsed = attempt_started.elapsed();

            let (output, failure) = match outcome {
                AttemptOutcome::Cancelled => {
                    tracing::info!(stage = %stage.id, attempt, "Stage cancelled");
                    break;
                }
                AttemptOutcome::Finished(output) => (Some(output), None),
                AttemptOutcome::Failed(reason, output) => (output, Some(reason)),
            };

            let logs = self.persist_logs(ctx, stage, attempt, output.as_ref()).await;
            result.attempts.push(AttemptRecord {
                attempt,
                exit_code: output.as_ref().map(|o| o.exit_code),
                duration_ms: elapsed.as_millis() as u64,
                failure: failure.clone(),
                logs,
            });

            if let Some(output) = &output {
                result.exit_code = Some(output.exit_code);
                result.stdout = output.stdout.clone();
                result.stderr = output.stderr.clone();
                result.findings = output.findings.clone();
            }

            let Some(reason) = failure else {
                let output = output.unwrap_or_default();
                result.status = match self.persist_outputs(ctx, stage, &output).await {
                    Ok(produced) => {
                        result.produced = produced;
                        ExecutionStatus::Succeeded
                    }
                    Err(err) => ExecutionStatus::Failed(classify(&err)),
                };
                result.duration = started.elapsed();
                return result;
            };

            if !reason.is_retryable() || attempt == max_attempts {
                tracing::warn!(stage = %stage.id, attempt, %reason, "Stage failed");
                result.status = ExecutionStatus::Failed(reason);
                result.duration = started.elapsed();
                return result;
            }

            let delay = stage.retry.delay_after(attempt);
            tracing::info!(
                stage = %stage.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "Retrying stage"
            );
            on_progress(StageProgress::Retrying {
                attempt,
                delay,
                reason,
            });

            let interrupted = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                break;
            }
        }

        result.status = ExecutionStatus::Cancelled;
        result.duration = started.elapsed();
        result
    }

    async fn persist_logs(
        &self,
        ctx: &ExecutionContext,
        stage: &StageDefinition,
        attempt: u32,
        output: Option<&ExecutionOutput>,
    ) -> Vec<ArtifactRef> {
        let Some(output) = output else {
            return Vec::new();
        };

        let mut logs = Vec::new();
        for (stream, content) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
            let name = format!("attempt-{}/{}", attempt, stream);
            match self
                .store
                .put(&ctx.run_id, &stage.id, &name, content.as_bytes())
                .await
            {
                Ok(artifact) => logs.push(artifact),
                Err(err) => {
                    tracing::warn!(stage = %stage.id, %name, error = %err, "Failed to store log")
                }
            }
        }
        logs
    }

    async fn persist_outputs(
        &self,
        ctx: &ExecutionContext,
        stage: &StageDefinition,
        output: &ExecutionOutput,
    ) -> Result<Vec<ArtifactRef>, GantryError> {
        let mut produced = Vec::new();

        for artifact in &output.produced {
            produced.push(
                self.store
                    .put(&ctx.run_id, &stage.id, &artifact.name, &artifact.bytes)
                    .await?,
            );
        }

        if !output.findings.is_empty() {
            let json = serde_json::to_vec_pretty(&output.findings)?;
            produced.push(
                self.store
                    .put(&ctx.run_id, &stage.id, "findings.json", &json)
                    .await?,
            );
        }

        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FilesystemArtifactStore;
    use crate::executors::{Executor, ProducedArtifact};
    use crate::gate::{Finding, Severity};
    use crate::pipeline::dag::tests::make_stage;
    use crate::pipeline::{RetryPolicy, RunId, TriggerEvent};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Fails with the given exit code until `succeed_on`, then passes
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Executor for Flaky {
        async fn execute(
            &self,
            _: &StageDefinition,
            _: &ExecutionContext,
        ) -> Result<ExecutionOutput, GantryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(ExecutionOutput::success("ok")
                    .with_artifact(ProducedArtifact::new("app.jar", b"jar".to_vec()))
                    .with_findings(vec![Finding::new(Severity::Low, "CVE-1")]))
            } else {
                Ok(ExecutionOutput::failure(2, format!("attempt {} broke", call)))
            }
        }

        async fn check_available(&self) -> bool {
            true
        }

        fn validate_stage(&self, _: &StageDefinition) -> Result<(), GantryError> {
            Ok(())
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Executor for Sleeper {
        async fn execute(
            &self,
            _: &StageDefinition,
            _: &ExecutionContext,
        ) -> Result<ExecutionOutput, GantryError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ExecutionOutput::success(""))
        }

        async fn check_available(&self) -> bool {
            true
        }

        fn validate_stage(&self, _: &StageDefinition) -> Result<(), GantryError> {
            Ok(())
        }
    }

    struct Unauthorized;

    #[async_trait]
    impl Executor for Unauthorized {
        async fn execute(
            &self,
            _: &StageDefinition,
            _: &ExecutionContext,
        ) -> Result<ExecutionOutput, GantryError> {
            Err(GantryError::Auth {
                collaborator: "registry".into(),
                message: "denied".into(),
            })
        }

        async fn check_available(&self) -> bool {
            true
        }

        fn validate_stage(&self, _: &StageDefinition) -> Result<(), GantryError> {
            Ok(())
        }
    }

    fn setup(dir: &TempDir, executor: Arc<dyn Executor>) -> (StageRunner, ExecutionContext) {
        let store: Arc<dyn ArtifactStore> =
            Arc::new(FilesystemArtifactStore::new(dir.path().to_path_buf()).unwrap());
        let mut registry = ExecutorRegistry::new();
        registry.register("shell", executor);

        let ctx = ExecutionContext {
            run_id: RunId::new(),
            event: TriggerEvent::manual("main"),
            working_dir: dir.path().to_path_buf(),
            env: HashMap::new(),
            inputs: vec![],
            store: store.clone(),
        };
        (StageRunner::new(registry, store), ctx)
    }

    fn stage_with_retries(max_attempts: u32) -> StageDefinition {
        let mut stage = make_stage("build", &[]);
        stage.retry = RetryPolicy::new(max_attempts, 1);
        stage
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_retries_exactly_max_attempts() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
        });
        let (runner, ctx) = setup(&dir, executor.clone());
        let progress = Mutex::new(Vec::new());

        let result = runner
            .run(
                &stage_with_retries(3),
                Duration::from_secs(5),
                &ctx,
                no_cancel(),
                &|p| progress.lock().unwrap().push(p),
            )
            .await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(
            result.status,
            ExecutionStatus::Failed(FailureReason::NonZeroExit { exit_code: 2 })
        );
        assert!(result.stderr.contains("attempt 3"));

        let retries = progress
            .lock()
            .unwrap()
            .iter()
            .filter(|p| matches!(p, StageProgress::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);

        // Every attempt's logs were stored
        let stored = ctx.store.list(&ctx.run_id).await.unwrap();
        assert_eq!(stored.len(), 6);
        assert!(stored.iter().any(|a| a.name == "attempt-3/stderr"));
    }

    #[tokio::test]
    async fn test_success_after_retry_persists_outputs() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 2,
        });
        let (runner, ctx) = setup(&dir, executor);

        let result = runner
            .run(
                &stage_with_retries(3),
                Duration::from_secs(5),
                &ctx,
                no_cancel(),
                &|_| {},
            )
            .await;

        assert!(result.succeeded());
        assert_eq!(result.attempts.len(), 2);
        assert!(result.attempts[0].failure.is_some());
        assert!(result.attempts[1].failure.is_none());

        let names: Vec<_> = result.produced.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["app.jar", "findings.json"]);
        assert_eq!(ctx.store.get(&result.produced[0]).await.unwrap(), b"jar");
    }

    #[tokio::test]
    async fn test_timeout_fails_without_retry_by_default() {
        let dir = TempDir::new().unwrap();
        let (runner, ctx) = setup(&dir, Arc::new(Sleeper));

        let result = runner
            .run(
                &make_stage("build", &[]),
                Duration::from_millis(50),
                &ctx,
                no_cancel(),
                &|_| {},
            )
            .await;

        assert!(matches!(
            result.status,
            ExecutionStatus::Failed(FailureReason::Timeout { .. })
        ));
        assert_eq!(result.attempts.len(), 1);
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_at_once() {
        let dir = TempDir::new().unwrap();
        let (runner, ctx) = setup(&dir, Arc::new(Unauthorized));

        let result = runner
            .run(
                &stage_with_retries(5),
                Duration::from_secs(5),
                &ctx,
                no_cancel(),
                &|_| {},
            )
            .await;

        assert_eq!(result.attempts.len(), 1);
        assert!(matches!(
            result.status,
            ExecutionStatus::Failed(FailureReason::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_attempt() {
        let dir = TempDir::new().unwrap();
        let (runner, ctx) = setup(&dir, Arc::new(Sleeper));
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        });

        let result = runner
            .run(
                &make_stage("build", &[]),
                Duration::from_secs(30),
                &ctx,
                rx,
                &|_| {},
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_executor() {
        let dir = TempDir::new().unwrap();
        let (runner, ctx) = setup(&dir, Arc::new(Sleeper));
        let mut stage = make_stage("publish", &[]);
        stage.command = crate::pipeline::Command::Publish {};

        let result = runner
            .run(&stage, Duration::from_secs(1), &ctx, no_cancel(), &|_| {})
            .await;

        assert!(result.attempts.is_empty());
        assert!(matches!(
            result.status,
            ExecutionStatus::Failed(FailureReason::Error { .. })
        ));
    }
}
