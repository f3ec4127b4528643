// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Error types
//!
//! Config errors stop a pipeline before any run exists. Everything a stage
//! can hit at runtime is captured as a stage failure by the coordinator and
//! never escapes a run.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

/// Result type for gantry operations
pub type GantryResult<T> = Result<T, GantryError>;

/// Main error type for gantry
#[derive(Error, Debug, Diagnostic)]
pub enum GantryError {
    // ─────────────────────────────────────────────────────────────────────────
    // Config Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline file not found: {path}")]
    #[diagnostic(
        code(gantry::pipeline_not_found),
        help("Pass the pipeline with --pipeline or create gantry.yaml")
    )]
    PipelineNotFound { path: PathBuf },

    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(gantry::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Unknown field '{field}' in pipeline definition")]
    #[diagnostic(
        code(gantry::unknown_field),
        help("Remove '{field}' or check its spelling; pipeline definitions are strict")
    )]
    UnknownField { field: String, message: String },

    #[error("Stage '{stage}' is invalid: {reason}")]
    #[diagnostic(code(gantry::invalid_stage))]
    InvalidStage { stage: String, reason: String },

    #[error("Duplicate stage id '{stage}'")]
    #[diagnostic(code(gantry::duplicate_stage), help("Stage ids must be unique"))]
    DuplicateStage { stage: String },

    #[error("Circular dependency detected: {}", .stages.join(" → "))]
    #[diagnostic(
        code(gantry::circular_dependency),
        help("Review your stage dependencies to remove the cycle")
    )]
    CircularDependency { stages: Vec<String> },

    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    #[diagnostic(
        code(gantry::unknown_dependency),
        help("Check that '{dependency}' is defined in your pipeline")
    )]
    UnknownDependency { stage: String, dependency: String },

    #[error("Invalid engine configuration: {message}")]
    #[diagnostic(code(gantry::invalid_config))]
    InvalidConfig { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Stage Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Stage '{stage}' exited with code {exit_code}")]
    #[diagnostic(code(gantry::stage_failed))]
    StageFailed { stage: String, exit_code: i32 },

    #[error("Stage '{stage}' timed out after {seconds}s")]
    #[diagnostic(
        code(gantry::stage_timeout),
        help("Raise timeout_seconds on the stage or the pipeline")
    )]
    StageTimeout { stage: String, seconds: u64 },

    #[error("Tool '{tool}' execution failed: {error}")]
    #[diagnostic(code(gantry::tool_execution_failed))]
    ToolExecutionFailed {
        tool: String,
        error: String,
        #[help]
        help: Option<String>,
    },

    #[error("Executor not found for command: {command}")]
    #[diagnostic(
        code(gantry::executor_not_found),
        help("Register a collaborator for '{command}' stages before triggering the run")
    )]
    ExecutorNotFound { command: String },

    #[error("Stage '{stage}' blocked by gate: {count} finding(s) at blocking severity, {max} allowed")]
    #[diagnostic(code(gantry::gate_blocked))]
    GateBlocked { stage: String, count: usize, max: usize },

    #[error("Transient failure contacting {collaborator}: {message}")]
    #[diagnostic(code(gantry::transient_infra))]
    TransientInfra { collaborator: String, message: String },

    #[error("Authentication rejected by {collaborator}: {message}")]
    #[diagnostic(code(gantry::auth), help("Check the credentials configured for {collaborator}"))]
    Auth { collaborator: String, message: String },

    #[error("Stage input missing: {message}")]
    #[diagnostic(code(gantry::missing_input))]
    MissingInput { message: String },

    #[error("Stage '{stage}' did not produce '{pattern}'")]
    #[diagnostic(
        code(gantry::missing_output),
        help("Check the stage's outputs and report paths against what the command writes")
    )]
    MissingOutput { stage: String, pattern: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Artifact Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Artifact not found: {reference}")]
    #[diagnostic(code(gantry::artifact_not_found))]
    ArtifactNotFound { reference: String },

    #[error("Artifact '{name}' of stage '{stage}' was already written with different content")]
    #[diagnostic(
        code(gantry::artifact_conflict),
        help("Artifacts are write-once per run, stage and name")
    )]
    ArtifactConflict { stage: String, name: String },

    #[error("Artifact store error: {message}")]
    #[diagnostic(code(gantry::artifact_store))]
    ArtifactStore { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Run Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline run not found: {run_id}")]
    #[diagnostic(code(gantry::run_not_found))]
    RunNotFound { run_id: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(gantry::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(gantry::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(gantry::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(gantry::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(gantry::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(gantry::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for GantryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for GantryError {
    fn from(e: serde_yaml::Error) -> Self {
        let message = e.to_string();
        match unknown_field_name(&message) {
            Some(field) => Self::UnknownField { field, message },
            None => Self::Yaml { message },
        }
    }
}

impl From<serde_json::Error> for GantryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for GantryError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for GantryError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

/// Pull the offending field out of a serde "unknown field" message
fn unknown_field_name(message: &str) -> Option<String> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"unknown field `([^`]+)`").expect("static regex is valid")
    });
    re.captures(message).map(|c| c[1].to_string())
}

impl GantryError {
    /// Errors raised while loading or validating a pipeline definition.
    ///
    /// These map to CLI exit code 2 and never create a run.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::PipelineNotFound { .. }
                | Self::InvalidPipeline { .. }
                | Self::UnknownField { .. }
                | Self::InvalidStage { .. }
                | Self::DuplicateStage { .. }
                | Self::CircularDependency { .. }
                | Self::UnknownDependency { .. }
                | Self::InvalidConfig { .. }
                | Self::Yaml { .. }
                | Self::Toml { .. }
                | Self::FileReadError { .. }
        )
    }

    /// Failures worth another attempt under the stage's retry policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientInfra { .. } | Self::StageFailed { .. } | Self::StageTimeout { .. }
        )
    }

    /// Create a transient error for a collaborator
    pub fn transient(collaborator: &str, message: impl Into<String>) -> Self {
        Self::TransientInfra {
            collaborator: collaborator.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_field_extracted_from_yaml_error() {
        #[derive(Debug, serde::Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Strict {
            #[allow(dead_code)]
            id: String,
        }

        let err = serde_yaml::from_str::<Strict>("id: a\nbogus: 1\n").unwrap_err();
        match GantryError::from(err) {
            GantryError::UnknownField { field, .. } => assert_eq!(field, "bogus"),
            other => panic!("expected UnknownField, got {other:?}"),
        }
    }

    #[test]
    fn test_classification() {
        assert!(GantryError::CircularDependency { stages: vec![] }.is_config_error());
        assert!(!GantryError::transient("registry", "reset").is_config_error());
        assert!(GantryError::transient("registry", "reset").is_retryable());
        assert!(!GantryError::GateBlocked {
            stage: "scan".into(),
            count: 1,
            max: 0
        }
        .is_retryable());
        assert!(!GantryError::Auth {
            collaborator: "registry".into(),
            message: "denied".into()
        }
        .is_retryable());
    }
}
