// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Pipeline definitions and runs
//!
//! This module defines the pipeline schema, the stage graph, the scheduler
//! and the coordinator that drives a run from trigger to verdict.

mod coordinator;
pub(crate) mod dag;
mod definition;
mod run;
mod scheduler;
mod validation;

pub use coordinator::RunCoordinator;
pub use dag::DagBuilder;
pub use definition::*;
pub use run::{
    AttemptRecord, FailureReason, Interrupt, PipelineRun, RunId, RunState, RunSummary,
    RunVerdict, SkipReason, StageRun, StageState, TriggerEvent,
};
pub use scheduler::{Scheduler, StageOutcome};
pub use validation::{PipelineValidator, ValidationResult};
