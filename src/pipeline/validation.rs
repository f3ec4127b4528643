// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Pipeline validation
//!
//! Validates pipeline configuration before a run is created. Every problem
//! found is collected so `gantry validate` can report them all at once.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::errors::GantryError;
use crate::pipeline::{Command, DagBuilder, PipelineDefinition, StageCondition, StageDefinition};

fn stage_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("valid stage id regex"))
}

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline definition
    pub fn validate(pipeline: &PipelineDefinition) -> ValidationResult {
        let mut result = ValidationResult::new();

        if pipeline.stages.is_empty() {
            result.add_error(GantryError::InvalidPipeline {
                reason: "Pipeline has no stages defined".to_string(),
                help: Some("Add at least one entry under `stages:`".to_string()),
            });
        }

        if pipeline.timeout_seconds == 0 {
            result.add_error(GantryError::InvalidPipeline {
                reason: "timeout_seconds must be greater than zero".to_string(),
                help: None,
            });
        }

        let mut seen = HashSet::new();
        let mut duplicates = false;
        for stage in &pipeline.stages {
            if !seen.insert(stage.id.as_str()) {
                duplicates = true;
                result.add_error(GantryError::DuplicateStage {
                    stage: stage.id.clone(),
                });
            }
        }

        // Graph checks need unique ids
        if !duplicates {
            if let Err(e) = DagBuilder::build(pipeline) {
                result.add_error(e);
            }
        }

        for stage in &pipeline.stages {
            Self::validate_stage(stage, pipeline, &mut result);
        }

        result
    }

    /// Validate a single stage
    fn validate_stage(
        stage: &StageDefinition,
        pipeline: &PipelineDefinition,
        result: &mut ValidationResult,
    ) {
        let invalid = |reason: &str| GantryError::InvalidStage {
            stage: stage.id.clone(),
            reason: reason.to_string(),
        };

        if !stage_id_pattern().is_match(&stage.id) {
            result.add_error(invalid(
                "id must match [a-z0-9][a-z0-9_-]* (lowercase letters, digits, '-' and '_')",
            ));
        }

        match &stage.command {
            Command::Shell { run, .. } if run.trim().is_empty() => {
                result.add_error(invalid("shell command is empty"));
            }
            Command::Image { manifest } if manifest.trim().is_empty() => {
                result.add_error(invalid("image manifest is empty"));
            }
            Command::Deploy { manifests } if manifests.is_empty() => {
                result.add_error(invalid("deploy lists no manifests"));
            }
            _ => {}
        }

        if stage.retry.max_attempts == 0 {
            result.add_error(invalid("retry.max_attempts must be at least 1"));
        }

        if stage.retry.base_delay_ms > stage.retry.max_delay_ms {
            result.add_warning(format!(
                "Stage '{}': retry.base_delay_ms exceeds retry.max_delay_ms; every delay is capped",
                stage.id
            ));
        }

        if stage.timeout_seconds == Some(0) {
            result.add_error(invalid("timeout_seconds must be greater than zero"));
        }

        if let Some(timeout) = stage.timeout_seconds {
            if timeout > pipeline.timeout_seconds {
                result.add_warning(format!(
                    "Stage '{}': timeout {}s exceeds the pipeline timeout {}s",
                    stage.id, timeout, pipeline.timeout_seconds
                ));
            }
        }

        if stage.depends_on.contains(&stage.id) {
            // Reported as a cycle by the DAG check
            return;
        }

        let mut deps = HashSet::new();
        for dep in &stage.depends_on {
            if !deps.insert(dep) {
                result.add_warning(format!(
                    "Stage '{}': dependency '{}' is listed twice",
                    stage.id, dep
                ));
            }
        }

        if let Some(gate) = &stage.gate {
            if gate.block_on.is_empty() && gate.max_count > 0 {
                result.add_warning(format!(
                    "Stage '{}': gate blocks on no severities, so max_count has no effect",
                    stage.id
                ));
            }
            if stage.report.is_none() && matches!(stage.command, Command::Shell { .. }) {
                result.add_warning(format!(
                    "Stage '{}': gate set on a shell stage without `report`; it will always pass",
                    stage.id
                ));
            }
        }

        if matches!(stage.when, Some(StageCondition::Never)) {
            result.add_warning(format!("Stage '{}': condition is `never`; it will always be skipped", stage.id));
        }

        if stage.allow_failure && stage.gate.as_ref().is_some_and(|g| !g.block_on.is_empty()) {
            result.add_warning(format!(
                "Stage '{}': allow_failure turns blocking gate verdicts into advisories",
                stage.id
            ));
        }
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<GantryError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: GantryError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// The first error, if any
    pub fn into_result(self) -> Result<Vec<String>, GantryError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(self.warnings),
        }
    }
}
