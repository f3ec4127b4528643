// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Run state
//!
//! A `PipelineRun` is owned by its coordinator task. Everyone else sees
//! cloned snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::artifacts::ArtifactRef;
use crate::gate::{Finding, GateVerdict};
use crate::pipeline::{PipelineDefinition, TriggerType};

/// Identifier of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What started a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    /// Branch, tag or commit being built
    pub source_ref: String,
    pub trigger: TriggerType,
}

impl TriggerEvent {
    pub fn push(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            trigger: TriggerType::Push,
        }
    }

    pub fn manual(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            trigger: TriggerType::Manual,
        }
    }
}

/// Lifecycle of a single stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Ready,
    /// Dispatched, waiting for an engine worker
    Queued,
    Running,
    Retrying,
    Passed,
    FailedAdvisory,
    FailedFatal,
    Skipped,
    Cancelled,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::FailedAdvisory | Self::FailedFatal | Self::Skipped | Self::Cancelled
        )
    }

    /// Stage was dispatched and counts against the run's parallelism
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Retrying)
    }

    /// Stage holds a worker and is executing an attempt or backing off
    pub fn is_executing(self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Passed => "passed",
            Self::FailedAdvisory => "failed (advisory)",
            Self::FailedFatal => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a stage was skipped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// An upstream stage failed fatally
    Blocked { by: String },
    /// The stage's `when` condition did not hold
    Condition,
    /// The run stopped scheduling before this stage became ready
    Halted,
}

impl SkipReason {
    /// Whether dependents of a stage skipped for this reason must not run
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::Condition)
    }
}

/// Why a stage failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    NonZeroExit { exit_code: i32 },
    Timeout { seconds: u64 },
    TransientInfra { message: String },
    GateBlocked { blocking: usize, max_count: usize },
    /// Non-retryable executor error (auth, spawn failure, missing input)
    Error { message: String },
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NonZeroExit { .. } | Self::Timeout { .. } | Self::TransientInfra { .. }
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonZeroExit { exit_code } => write!(f, "exited with code {}", exit_code),
            Self::Timeout { seconds } => write!(f, "timed out after {}s", seconds),
            Self::TransientInfra { message } => write!(f, "infrastructure error: {}", message),
            Self::GateBlocked {
                blocking,
                max_count,
            } => write!(
                f,
                "gate blocked: {} blocking finding(s), {} allowed",
                blocking, max_count
            ),
            Self::Error { message } => write!(f, "{}", message),
        }
    }
}

/// One execution attempt of a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub failure: Option<FailureReason>,
    /// Logs captured for this attempt
    pub logs: Vec<ArtifactRef>,
}

/// Mutable state of one stage within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub stage_id: String,
    pub state: StageState,
    pub attempts: Vec<AttemptRecord>,
    pub verdict: Option<GateVerdict>,
    pub failure: Option<FailureReason>,
    pub skip_reason: Option<SkipReason>,
    pub artifacts: Vec<ArtifactRef>,
    pub findings: Vec<Finding>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRun {
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            state: StageState::Pending,
            attempts: Vec::new(),
            verdict: None,
            failure: None,
            skip_reason: None,
            artifacts: Vec::new(),
            findings: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Dependents of this stage may run
    pub fn satisfies_dependents(&self) -> bool {
        match self.state {
            StageState::Passed | StageState::FailedAdvisory => true,
            StageState::Skipped => self.skip_reason.as_ref().is_some_and(|r| !r.is_blocking()),
            _ => false,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }
}

/// Run-level state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Scheduling,
    Running,
    Finalizing,
    Finished(RunVerdict),
}

/// Final outcome of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Succeeded,
    /// Every required stage passed, with advisory failures recorded
    PartiallySucceededWithAdvisories,
    Failed,
    Cancelled,
}

impl RunVerdict {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallySucceededWithAdvisories)
    }
}

impl std::fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::PartiallySucceededWithAdvisories => write!(f, "succeeded with advisories"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a run stopped before all stages finished
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interrupt {
    Cancelled { reason: String },
    TimedOut { seconds: u64 },
}

/// One execution of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline: String,
    pub event: TriggerEvent,
    pub state: RunState,
    /// Stage runs in declaration order
    pub stages: Vec<StageRun>,
    /// Set by the first fatal failure; no new stages start afterwards
    pub halted: bool,
    pub interrupt: Option<Interrupt>,
    /// First stage to fail fatally, in completion order
    pub primary_failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(id: RunId, definition: &PipelineDefinition, event: TriggerEvent) -> Self {
        Self {
            id,
            pipeline: definition.name.clone(),
            event,
            state: RunState::Initializing,
            stages: definition.stages.iter().map(|s| StageRun::new(&s.id)).collect(),
            halted: false,
            interrupt: None,
            primary_failure: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn stage(&self, id: &str) -> Option<&StageRun> {
        self.stages.iter().find(|s| s.stage_id == id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut StageRun> {
        self.stages.iter_mut().find(|s| s.stage_id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<StageState> {
        self.stage(id).map(|s| s.state)
    }

    pub fn active_count(&self) -> usize {
        self.stages.iter().filter(|s| s.state.is_active()).count()
    }

    pub fn verdict(&self) -> Option<RunVerdict> {
        match self.state {
            RunState::Finished(verdict) => Some(verdict),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.verdict().is_some()
    }

    /// Close the run: unstarted stages become Skipped(Halted) and the
    /// verdict is computed from every stage's terminal state.
    pub fn finalize(&mut self) -> RunVerdict {
        self.state = RunState::Finalizing;
        let now = Utc::now();

        for stage in &mut self.stages {
            if stage.state.is_waiting() {
                stage.state = StageState::Skipped;
                stage.skip_reason = Some(SkipReason::Halted);
                stage.finished_at = Some(now);
            }
        }

        let any = |pred: &dyn Fn(&StageRun) -> bool| self.stages.iter().any(pred);
        let failed = any(&|s| s.state == StageState::FailedFatal)
            || any(&|s| {
                s.state == StageState::Skipped
                    && matches!(s.skip_reason, Some(SkipReason::Blocked { .. }))
            });

        let verdict = if failed || matches!(self.interrupt, Some(Interrupt::TimedOut { .. })) {
            RunVerdict::Failed
        } else if matches!(self.interrupt, Some(Interrupt::Cancelled { .. })) {
            RunVerdict::Cancelled
        } else if any(&|s| s.state == StageState::FailedAdvisory) {
            RunVerdict::PartiallySucceededWithAdvisories
        } else {
            RunVerdict::Succeeded
        };

        self.state = RunState::Finished(verdict);
        self.finished_at = Some(now);
        verdict
    }

    /// Diagnostic summary of a finished run
    pub fn summary(&self) -> RunSummary {
        let ids_where = |pred: &dyn Fn(&StageRun) -> bool| {
            self.stages
                .iter()
                .filter(|s| pred(s))
                .map(|s| s.stage_id.clone())
                .collect::<Vec<_>>()
        };

        RunSummary {
            verdict: self.verdict(),
            primary_failure: self.primary_failure.as_ref().and_then(|id| {
                let stage = self.stage(id)?;
                Some((id.clone(), stage.failure.clone()?))
            }),
            interrupt: self.interrupt.clone(),
            blocked: ids_where(&|s| matches!(s.skip_reason, Some(SkipReason::Blocked { .. }))),
            not_run: ids_where(&|s| matches!(s.skip_reason, Some(SkipReason::Halted))),
            advisories: ids_where(&|s| {
                s.state == StageState::FailedAdvisory
                    || matches!(s.verdict, Some(GateVerdict::AdvisoryFail { .. }))
            }),
            cancelled: ids_where(&|s| s.state == StageState::Cancelled),
        }
    }
}

/// Why a run ended the way it did
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub verdict: Option<RunVerdict>,
    /// The first fatal failure decides the run's failure reason
    pub primary_failure: Option<(String, FailureReason)>,
    pub interrupt: Option<Interrupt>,
    /// Secondary causes: stages skipped behind the fatal failure
    pub blocked: Vec<String>,
    pub not_run: Vec<String>,
    pub advisories: Vec<String>,
    pub cancelled: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::dag::tests::make_test_pipeline;

    fn run_of(stages: Vec<(&str, Vec<&str>)>) -> PipelineRun {
        let definition = make_test_pipeline(stages);
        PipelineRun::new(RunId::new(), &definition, TriggerEvent::push("main"))
    }

    fn set(run: &mut PipelineRun, id: &str, state: StageState) {
        run.stage_mut(id).unwrap().state = state;
    }

    #[test]
    fn test_run_id_round_trips_through_string() {
        let id = RunId::new();
        assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }

    #[test]
    fn test_all_passed_succeeds() {
        let mut run = run_of(vec![("a", vec![]), ("b", vec!["a"])]);
        set(&mut run, "a", StageState::Passed);
        set(&mut run, "b", StageState::Passed);

        assert_eq!(run.finalize(), RunVerdict::Succeeded);
        assert!(run.is_finished());
    }

    #[test]
    fn test_advisories_still_succeed() {
        let mut run = run_of(vec![("scan", vec![]), ("publish", vec!["scan"])]);
        set(&mut run, "scan", StageState::FailedAdvisory);
        set(&mut run, "publish", StageState::Passed);

        let verdict = run.finalize();
        assert_eq!(verdict, RunVerdict::PartiallySucceededWithAdvisories);
        assert!(verdict.is_success());
        assert_eq!(run.summary().advisories, vec!["scan"]);
    }

    #[test]
    fn test_unstarted_stages_become_halted_skips() {
        let mut run = run_of(vec![("a", vec![]), ("b", vec![])]);
        set(&mut run, "a", StageState::FailedFatal);
        run.stage_mut("a").unwrap().failure = Some(FailureReason::NonZeroExit { exit_code: 2 });
        run.primary_failure = Some("a".into());

        assert_eq!(run.finalize(), RunVerdict::Failed);
        assert_eq!(run.state_of("b"), Some(StageState::Skipped));

        let summary = run.summary();
        assert_eq!(summary.not_run, vec!["b"]);
        assert_eq!(
            summary.primary_failure,
            Some(("a".into(), FailureReason::NonZeroExit { exit_code: 2 }))
        );
    }

    #[test]
    fn test_cancelled_and_timed_out_runs() {
        let mut run = run_of(vec![("a", vec![])]);
        set(&mut run, "a", StageState::Cancelled);
        run.interrupt = Some(Interrupt::Cancelled {
            reason: "superseded".into(),
        });
        assert_eq!(run.finalize(), RunVerdict::Cancelled);

        let mut run = run_of(vec![("a", vec![])]);
        set(&mut run, "a", StageState::Cancelled);
        run.interrupt = Some(Interrupt::TimedOut { seconds: 60 });
        assert_eq!(run.finalize(), RunVerdict::Failed);
    }

    #[test]
    fn test_condition_skip_satisfies_dependents() {
        let mut stage = StageRun::new("optional");
        stage.state = StageState::Skipped;
        stage.skip_reason = Some(SkipReason::Condition);
        assert!(stage.satisfies_dependents());

        stage.skip_reason = Some(SkipReason::Blocked { by: "build".into() });
        assert!(!stage.satisfies_dependents());
    }
}
