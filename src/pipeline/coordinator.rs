// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Pipeline run coordinator
//!
//! The coordinator task is the only writer of a `PipelineRun`. Stage tasks
//! report progress and results over an mpsc channel; the coordinator applies
//! them, evaluates gates, asks the scheduler for more work and publishes a
//! snapshot after every change.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::artifacts::{ArtifactRef, ArtifactStore};
use crate::executors::{
    cancelled, ExecutionContext, ExecutionStatus, StageProgress, StageResult, StageRunner,
};
use crate::gate::{GateEvaluator, GateVerdict};
use crate::pipeline::run::{FailureReason, Interrupt, PipelineRun, RunState, SkipReason, StageState};
use crate::pipeline::scheduler::{Scheduler, StageOutcome};
use crate::pipeline::{PipelineDefinition, StageDefinition};

/// Messages from stage tasks to the coordinator
#[derive(Debug)]
enum StageMessage {
    Progress {
        stage_id: String,
        progress: StageProgress,
    },
    Finished(StageResult),
}

/// Drives one `PipelineRun` to a verdict
pub struct RunCoordinator {
    run: PipelineRun,
    definition: Arc<PipelineDefinition>,
    scheduler: Scheduler,
    runner: StageRunner,
    workers: Arc<Semaphore>,
    working_dir: PathBuf,
    snapshots: watch::Sender<PipelineRun>,
}

impl RunCoordinator {
    pub fn new(
        run: PipelineRun,
        scheduler: Scheduler,
        runner: StageRunner,
        workers: Arc<Semaphore>,
        working_dir: PathBuf,
        snapshots: watch::Sender<PipelineRun>,
    ) -> Self {
        let definition = scheduler.definition().clone();
        Self {
            run,
            definition,
            scheduler,
            runner,
            workers,
            working_dir,
            snapshots,
        }
    }

    fn store(&self) -> Arc<dyn ArtifactStore> {
        self.runner.store()
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.run.clone());
    }

    /// Run the pipeline until every reachable stage is terminal.
    ///
    /// `control` carries a cancellation reason once cancellation is requested.
    pub async fn run(mut self, mut control: watch::Receiver<Option<String>>) -> PipelineRun {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stage_cancel, stage_cancel_rx) = watch::channel(false);

        tracing::info!(
            run_id = %self.run.id,
            pipeline = %self.run.pipeline,
            source_ref = %self.run.event.source_ref,
            trigger = %self.run.event.trigger,
            "Run started"
        );

        self.run.state = RunState::Scheduling;
        self.scheduler.promote_ready(&mut self.run);
        self.publish();

        let cancel_reason = control.borrow_and_update().clone();
        if let Some(reason) = cancel_reason {
            self.interrupt(Interrupt::Cancelled { reason }, &stage_cancel);
        }
        let mut control_open = true;

        let global_timeout = self.definition.timeout_seconds;
        let deadline = tokio::time::sleep(Duration::from_secs(global_timeout));
        tokio::pin!(deadline);

        loop {
            self.dispatch(&tx, &stage_cancel_rx);
            self.publish();

            if self.scheduler.is_settled(&self.run) {
                break;
            }

            tokio::select! {
                Some(message) = rx.recv() => self.apply(message),
                _ = &mut deadline, if self.run.interrupt.is_none() => {
                    tracing::warn!(run_id = %self.run.id, seconds = global_timeout, "Run timed out");
                    self.interrupt(Interrupt::TimedOut { seconds: global_timeout }, &stage_cancel);
                }
                changed = control.changed(), if control_open && self.run.interrupt.is_none() => {
                    match changed {
                        Ok(()) => {
                            let reason = control.borrow_and_update().clone();
                            if let Some(reason) = reason {
                                tracing::info!(run_id = %self.run.id, %reason, "Run cancelled");
                                self.interrupt(Interrupt::Cancelled { reason }, &stage_cancel);
                            }
                        }
                        Err(_) => control_open = false,
                    }
                }
            }
        }

        let verdict = self.run.finalize();
        self.publish();

        let summary = self.run.summary();
        match &summary.primary_failure {
            Some((stage, reason)) => tracing::info!(
                run_id = %self.run.id,
                %verdict,
                primary_failure = %stage,
                %reason,
                blocked = summary.blocked.len(),
                "Run finished"
            ),
            None => tracing::info!(run_id = %self.run.id, %verdict, "Run finished"),
        }

        self.run
    }

    fn interrupt(&mut self, interrupt: Interrupt, stage_cancel: &watch::Sender<bool>) {
        self.run.interrupt.get_or_insert(interrupt);
        stage_cancel.send_replace(true);
    }

    /// Start every stage that may start now
    fn dispatch(
        &mut self,
        tx: &mpsc::UnboundedSender<StageMessage>,
        stage_cancel: &watch::Receiver<bool>,
    ) {
        loop {
            let batch = self.scheduler.next_batch(&self.run);
            if batch.is_empty() {
                return;
            }

            for id in batch {
                let Some(stage) = self.definition.get_stage(&id).cloned() else {
                    continue;
                };

                let env = self.stage_env(&stage);
                let runs = stage.when.as_ref().map_or(true, |condition| {
                    condition.holds(&self.working_dir, &env, self.run.event.trigger)
                });
                if !runs {
                    tracing::info!(stage = %id, "Condition not met, skipping");
                    self.scheduler
                        .advance(&mut self.run, &id, StageOutcome::Skipped(SkipReason::Condition));
                    continue;
                }

                self.scheduler.start(&mut self.run, &id);
                self.run.state = RunState::Running;
                tracing::info!(stage = %id, command = stage.command_name(), "Stage dispatched");

                let ctx = ExecutionContext {
                    run_id: self.run.id.clone(),
                    event: self.run.event.clone(),
                    working_dir: self.working_dir.clone(),
                    env,
                    inputs: self.inputs_for(&stage),
                    store: self.store(),
                };
                self.spawn_stage(stage, ctx, tx.clone(), stage_cancel.clone());
            }
        }
    }

    fn spawn_stage(
        &self,
        stage: StageDefinition,
        ctx: ExecutionContext,
        tx: mpsc::UnboundedSender<StageMessage>,
        cancel: watch::Receiver<bool>,
    ) {
        let runner = self.runner.clone();
        let workers = self.workers.clone();
        let timeout = self.definition.stage_timeout(&stage);
        let stage_id = stage.id.clone();
        let progress_tx = tx.clone();

        let task = tokio::spawn(async move {
            let mut waiting = cancel.clone();
            let permit = tokio::select! {
                biased;
                _ = cancelled(&mut waiting) => None,
                permit = workers.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                return StageResult::without_attempts(&stage.id, ExecutionStatus::Cancelled);
            };

            let id = stage.id.clone();
            let on_progress = move |progress| {
                let _ = progress_tx.send(StageMessage::Progress {
                    stage_id: id.clone(),
                    progress,
                });
            };
            runner.run(&stage, timeout, &ctx, cancel, &on_progress).await
        });

        // A panicking stage still reports a result
        tokio::spawn(async move {
            let result = task.await.unwrap_or_else(|e| {
                tracing::error!(stage = %stage_id, error = %e, "Stage task failed");
                StageResult::without_attempts(
                    &stage_id,
                    ExecutionStatus::Failed(FailureReason::Error {
                        message: format!("stage task failed: {}", e),
                    }),
                )
            });
            let _ = tx.send(StageMessage::Finished(result));
        });
    }

    /// Pipeline env overlaid with the stage env
    fn stage_env(&self, stage: &StageDefinition) -> HashMap<String, String> {
        let mut env = self.definition.env.clone();
        env.extend(stage.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Artifacts produced by every upstream stage, nearest producers last
    fn inputs_for(&self, stage: &StageDefinition) -> Vec<ArtifactRef> {
        self.scheduler
            .dag()
            .ancestors(&stage.id)
            .iter()
            .filter_map(|id| self.run.stage(id))
            .flat_map(|upstream| upstream.artifacts.iter().cloned())
            .collect()
    }

    fn apply(&mut self, message: StageMessage) {
        match message {
            StageMessage::Progress { stage_id, progress } => {
                let Some(stage) = self.run.stage_mut(&stage_id) else {
                    return;
                };
                if !stage.state.is_active() {
                    return;
                }
                stage.state = match progress {
                    StageProgress::Attempt { .. } => {
                        stage.started_at.get_or_insert_with(Utc::now);
                        StageState::Running
                    }
                    StageProgress::Retrying { .. } => StageState::Retrying,
                };
            }
            StageMessage::Finished(result) => self.apply_result(result),
        }
    }

    fn apply_result(&mut self, result: StageResult) {
        let Some(definition) = self.definition.get_stage(&result.stage_id) else {
            return;
        };
        let allow_failure = definition.allow_failure;
        let verdict = result
            .succeeded()
            .then(|| GateEvaluator::evaluate(&result, definition.gate.as_ref()));

        let outcome = match (&result.status, &verdict) {
            (ExecutionStatus::Cancelled, _) => StageOutcome::Cancelled,
            (ExecutionStatus::Failed(reason), _) if allow_failure => {
                StageOutcome::FailedAdvisory(Some(reason.clone()))
            }
            (ExecutionStatus::Failed(reason), _) => StageOutcome::FailedFatal(reason.clone()),
            (ExecutionStatus::Succeeded, Some(GateVerdict::Fatal { blocking, max_count })) => {
                let reason = FailureReason::GateBlocked {
                    blocking: *blocking,
                    max_count: *max_count,
                };
                if allow_failure {
                    StageOutcome::FailedAdvisory(Some(reason))
                } else {
                    StageOutcome::FailedFatal(reason)
                }
            }
            (ExecutionStatus::Succeeded, Some(GateVerdict::AdvisoryFail { .. })) => {
                StageOutcome::FailedAdvisory(None)
            }
            (ExecutionStatus::Succeeded, _) => StageOutcome::Passed,
        };

        tracing::info!(
            stage = %result.stage_id,
            attempts = result.attempts.len(),
            duration_ms = result.duration.as_millis() as u64,
            outcome = ?outcome,
            "Stage finished"
        );

        if let Some(stage) = self.run.stage_mut(&result.stage_id) {
            stage.attempts = result.attempts;
            stage.artifacts = result.produced;
            stage.findings = result.findings;
            stage.verdict = verdict;
        }

        self.scheduler.advance(&mut self.run, &result.stage_id, outcome);
    }
}
