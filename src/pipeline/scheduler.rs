// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Stage scheduling
//!
//! Decides which stages may start and applies stage outcomes to a run.
//! A fatal failure skips every unstarted transitive dependent and stops
//! new work, while stages already running are left to finish.

use chrono::Utc;
use std::sync::Arc;

use crate::errors::GantryError;
use crate::pipeline::run::{FailureReason, PipelineRun, SkipReason, StageState};
use crate::pipeline::{DagBuilder, PipelineDefinition};

/// Terminal outcome reported for a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Passed,
    FailedAdvisory(Option<FailureReason>),
    FailedFatal(FailureReason),
    Skipped(SkipReason),
    Cancelled,
}

impl StageOutcome {
    fn state(&self) -> StageState {
        match self {
            Self::Passed => StageState::Passed,
            Self::FailedAdvisory(_) => StageState::FailedAdvisory,
            Self::FailedFatal(_) => StageState::FailedFatal,
            Self::Skipped(_) => StageState::Skipped,
            Self::Cancelled => StageState::Cancelled,
        }
    }
}

/// DAG scheduler for one pipeline definition
#[derive(Debug, Clone)]
pub struct Scheduler {
    definition: Arc<PipelineDefinition>,
    dag: DagBuilder,
    max_parallelism: usize,
}

impl Scheduler {
    /// Create a scheduler; fails if the definition's graph is invalid
    pub fn new(
        definition: Arc<PipelineDefinition>,
        max_parallelism: usize,
    ) -> Result<Self, GantryError> {
        let dag = DagBuilder::build(&definition)?;
        Ok(Self {
            definition,
            dag,
            max_parallelism: max_parallelism.max(1),
        })
    }

    pub fn definition(&self) -> &Arc<PipelineDefinition> {
        &self.definition
    }

    pub fn dag(&self) -> &DagBuilder {
        &self.dag
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Stages whose dependencies are satisfied and that have not started,
    /// in declaration order. Empty once the run has halted or stopped.
    pub fn ready(&self, run: &PipelineRun) -> Vec<String> {
        if run.halted || run.interrupt.is_some() {
            return Vec::new();
        }

        self.definition
            .stages
            .iter()
            .filter(|stage| run.state_of(&stage.id).is_some_and(StageState::is_waiting))
            .filter(|stage| {
                stage.depends_on.iter().all(|dep| {
                    run.stage(dep)
                        .is_some_and(|dep_run| dep_run.satisfies_dependents())
                })
            })
            .map(|stage| stage.id.clone())
            .collect()
    }

    /// Ready stages that fit in the remaining parallelism budget
    pub fn next_batch(&self, run: &PipelineRun) -> Vec<String> {
        let capacity = self.max_parallelism.saturating_sub(run.active_count());
        self.ready(run).into_iter().take(capacity).collect()
    }

    /// Mark a stage as dispatched. It becomes Running once a worker picks it up.
    pub fn start(&self, run: &mut PipelineRun, stage_id: &str) {
        if let Some(stage) = run.stage_mut(stage_id) {
            stage.state = StageState::Queued;
        }
    }

    /// Record a stage's terminal outcome and recompute readiness
    pub fn advance(&self, run: &mut PipelineRun, stage_id: &str, outcome: StageOutcome) {
        let Some(stage) = run.stage_mut(stage_id) else {
            tracing::warn!(stage = stage_id, "Outcome reported for unknown stage");
            return;
        };

        stage.state = outcome.state();
        stage.finished_at = Some(Utc::now());

        match outcome {
            StageOutcome::FailedFatal(reason) => {
                stage.failure = Some(reason);
                self.block_dependents(run, stage_id);
                run.halted = true;
                run.primary_failure.get_or_insert_with(|| stage_id.to_string());
            }
            StageOutcome::FailedAdvisory(reason) => stage.failure = reason,
            StageOutcome::Skipped(reason) => stage.skip_reason = Some(reason),
            StageOutcome::Passed | StageOutcome::Cancelled => {}
        }

        self.promote_ready(run);
    }

    fn block_dependents(&self, run: &mut PipelineRun, failed: &str) {
        for id in self.dag.descendants(failed) {
            let Some(dependent) = run.stage_mut(&id) else {
                continue;
            };
            if dependent.state.is_waiting() {
                tracing::debug!(stage = %id, blocked_by = failed, "Skipping blocked stage");
                dependent.state = StageState::Skipped;
                dependent.skip_reason = Some(SkipReason::Blocked {
                    by: failed.to_string(),
                });
                dependent.finished_at = Some(Utc::now());
            }
        }
    }

    /// Move Pending stages with satisfied dependencies to Ready
    pub fn promote_ready(&self, run: &mut PipelineRun) {
        for id in self.ready(run) {
            if let Some(stage) = run.stage_mut(&id) {
                stage.state = StageState::Ready;
            }
        }
    }

    /// Nothing is running and nothing more can start
    pub fn is_settled(&self, run: &PipelineRun) -> bool {
        run.active_count() == 0 && self.ready(run).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::dag::tests::make_test_pipeline;
    use crate::pipeline::run::{RunId, TriggerEvent};

    fn setup(stages: Vec<(&str, Vec<&str>)>, parallelism: usize) -> (Scheduler, PipelineRun) {
        let definition = Arc::new(make_test_pipeline(stages));
        let scheduler = Scheduler::new(definition.clone(), parallelism).unwrap();
        let mut run = PipelineRun::new(RunId::new(), &definition, TriggerEvent::push("main"));
        scheduler.promote_ready(&mut run);
        (scheduler, run)
    }

    fn fan_out() -> Vec<(&'static str, Vec<&'static str>)> {
        vec![
            ("checkout", vec![]),
            ("lint", vec!["checkout"]),
            ("sast", vec!["checkout"]),
            ("build", vec!["checkout"]),
            ("scan", vec!["build"]),
            ("publish", vec!["scan", "lint", "sast"]),
        ]
    }

    #[test]
    fn test_ready_respects_dependencies() {
        let (scheduler, mut run) = setup(fan_out(), 8);

        assert_eq!(scheduler.ready(&run), vec!["checkout"]);
        assert_eq!(run.state_of("checkout"), Some(StageState::Ready));
        assert_eq!(run.state_of("lint"), Some(StageState::Pending));

        scheduler.start(&mut run, "checkout");
        assert!(scheduler.ready(&run).is_empty());

        scheduler.advance(&mut run, "checkout", StageOutcome::Passed);
        assert_eq!(scheduler.ready(&run), vec!["lint", "sast", "build"]);
    }

    #[test]
    fn test_ready_never_returns_unsatisfied_stage() {
        let (scheduler, mut run) = setup(fan_out(), 8);

        // Drive the whole pipeline, checking readiness at every step
        while !scheduler.is_settled(&run) {
            for id in scheduler.ready(&run) {
                let stage = scheduler.definition.get_stage(&id).unwrap();
                for dep in &stage.depends_on {
                    assert!(run.stage(dep).unwrap().satisfies_dependents());
                }
                scheduler.start(&mut run, &id);
                scheduler.advance(&mut run, &id, StageOutcome::Passed);
            }
        }

        assert!(run.stages.iter().all(|s| s.state == StageState::Passed));
    }

    #[test]
    fn test_next_batch_bounded_by_parallelism() {
        let (scheduler, mut run) = setup(fan_out(), 2);
        scheduler.start(&mut run, "checkout");
        scheduler.advance(&mut run, "checkout", StageOutcome::Passed);

        assert_eq!(scheduler.next_batch(&run), vec!["lint", "sast"]);
        scheduler.start(&mut run, "lint");
        assert_eq!(scheduler.next_batch(&run), vec!["sast"]);
        scheduler.start(&mut run, "sast");
        assert!(scheduler.next_batch(&run).is_empty());
    }

    #[test]
    fn test_fatal_failure_skips_transitive_dependents() {
        let (scheduler, mut run) = setup(fan_out(), 8);
        scheduler.start(&mut run, "checkout");
        scheduler.advance(&mut run, "checkout", StageOutcome::Passed);
        for id in ["lint", "sast", "build"] {
            scheduler.start(&mut run, id);
        }

        scheduler.advance(
            &mut run,
            "build",
            StageOutcome::FailedFatal(FailureReason::NonZeroExit { exit_code: 1 }),
        );

        for id in ["scan", "publish"] {
            let stage = run.stage(id).unwrap();
            assert_eq!(stage.state, StageState::Skipped);
            assert_eq!(
                stage.skip_reason,
                Some(SkipReason::Blocked {
                    by: "build".into()
                })
            );
        }

        // Dispatched siblings are not preempted, but nothing new starts
        assert_eq!(run.state_of("lint"), Some(StageState::Queued));
        assert!(scheduler.ready(&run).is_empty());
        assert_eq!(run.primary_failure.as_deref(), Some("build"));

        scheduler.advance(&mut run, "lint", StageOutcome::Passed);
        scheduler.advance(&mut run, "sast", StageOutcome::Passed);
        assert!(scheduler.is_settled(&run));
    }

    #[test]
    fn test_halt_stops_independent_stages() {
        let (scheduler, mut run) = setup(vec![("a", vec![]), ("b", vec![]), ("c", vec![])], 1);

        scheduler.start(&mut run, "a");
        scheduler.advance(
            &mut run,
            "a",
            StageOutcome::FailedFatal(FailureReason::Timeout { seconds: 5 }),
        );

        assert!(scheduler.ready(&run).is_empty());
        assert_eq!(run.state_of("b"), Some(StageState::Ready));
        assert!(scheduler.is_settled(&run));
    }

    #[test]
    fn test_advisory_failure_does_not_block() {
        let (scheduler, mut run) = setup(vec![("scan", vec![]), ("publish", vec!["scan"])], 4);

        scheduler.start(&mut run, "scan");
        scheduler.advance(&mut run, "scan", StageOutcome::FailedAdvisory(None));

        assert_eq!(scheduler.ready(&run), vec!["publish"]);
    }

    #[test]
    fn test_condition_skip_does_not_block() {
        let (scheduler, mut run) = setup(vec![("docs", vec![]), ("site", vec!["docs"])], 4);

        scheduler.advance(&mut run, "docs", StageOutcome::Skipped(SkipReason::Condition));

        assert_eq!(scheduler.ready(&run), vec!["site"]);
    }

    #[test]
    fn test_first_fatal_failure_is_primary() {
        let (scheduler, mut run) = setup(vec![("a", vec![]), ("b", vec![])], 4);
        scheduler.start(&mut run, "a");
        scheduler.start(&mut run, "b");

        scheduler.advance(
            &mut run,
            "b",
            StageOutcome::FailedFatal(FailureReason::NonZeroExit { exit_code: 3 }),
        );
        scheduler.advance(
            &mut run,
            "a",
            StageOutcome::FailedFatal(FailureReason::NonZeroExit { exit_code: 4 }),
        );

        assert_eq!(run.primary_failure.as_deref(), Some("b"));
    }
}
