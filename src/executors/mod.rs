// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Stage executors
//!
//! This module provides the executor trait, the shell executor, executors
//! backed by external collaborators, and the runner that wraps any executor
//! with timeouts, retries and artifact persistence.

mod collaborators;
mod runner;
mod shell;

pub use collaborators::{
    BuildExecutor, BuildTool, ClusterClient, DeployExecutor, ImageBuilder, ImageExecutor,
    PublishExecutor, PushError, RegistryClient, RolloutStatus, ScanExecutor,
    VulnerabilityScanner, BUILD_ARTIFACT, IMAGE_REF_ARTIFACT,
};
pub(crate) use runner::cancelled;
pub use runner::{StageProgress, StageRunner};
pub use shell::ShellExecutor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::artifacts::{ArtifactRef, ArtifactStore};
use crate::errors::GantryError;
use crate::gate::Finding;
use crate::pipeline::{AttemptRecord, FailureReason, PipelineDefinition, RunId, StageDefinition, TriggerEvent};

/// Everything an executor may use while running a stage
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub event: TriggerEvent,
    pub working_dir: PathBuf,
    /// Pipeline env merged with stage env (stage wins)
    pub env: HashMap<String, String>,
    /// Artifacts produced by every upstream stage, nearest producers last
    pub inputs: Vec<ArtifactRef>,
    pub store: Arc<dyn ArtifactStore>,
}

impl ExecutionContext {
    /// Most recent input artifact with this name
    pub fn input(&self, name: &str) -> Option<&ArtifactRef> {
        self.inputs.iter().rev().find(|a| a.name == name)
    }

    /// Read an input artifact's bytes
    pub async fn read_input(&self, name: &str) -> Result<Vec<u8>, GantryError> {
        let artifact = self.input(name).ok_or_else(|| GantryError::MissingInput {
            message: format!("no upstream stage produced '{}'", name),
        })?;
        self.store.get(artifact).await
    }
}

/// Bytes a stage wants stored under a name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ProducedArtifact {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Raw output of one execution attempt
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub produced: Vec<ProducedArtifact>,
    pub findings: Vec<Finding>,
}

impl ExecutionOutput {
    /// Create a successful output
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Create a failed output
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn with_artifact(mut self, artifact: ProducedArtifact) -> Self {
        self.produced.push(artifact);
        self
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }
}

/// How a stage execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Succeeded,
    Failed(FailureReason),
    Cancelled,
}

/// Durable result of running a stage, including every attempt
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage_id: String,
    pub status: ExecutionStatus,
    /// Exit code of the last attempt, if it got that far
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub produced: Vec<ArtifactRef>,
    pub findings: Vec<Finding>,
    pub duration: Duration,
    pub attempts: Vec<AttemptRecord>,
}

impl StageResult {
    /// Result for a stage that ended without completing an attempt
    pub fn without_attempts(stage_id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            stage_id: stage_id.into(),
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            produced: Vec::new(),
            findings: Vec::new(),
            duration: Duration::ZERO,
            attempts: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// Trait for stage executors
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one attempt of a stage.
    ///
    /// A non-zero `exit_code` is a normal return; `Err` is reserved for
    /// failures to run at all, classified by the runner for retries.
    async fn execute(
        &self,
        stage: &StageDefinition,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, GantryError>;

    /// Check if the executor's tooling is available
    async fn check_available(&self) -> bool;

    /// Validate stage configuration
    fn validate_stage(&self, stage: &StageDefinition) -> Result<(), GantryError>;
}

/// Executors by command kind
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in shell executor
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("shell", Arc::new(ShellExecutor::new()));
        registry
    }

    /// Register an executor for a command kind
    pub fn register(&mut self, kind: &str, executor: Arc<dyn Executor>) {
        self.executors.insert(kind.to_string(), executor);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(kind).cloned()
    }

    /// Command kinds used by the pipeline that have no available executor
    pub async fn missing_executors(&self, pipeline: &PipelineDefinition) -> Vec<String> {
        let mut kinds: Vec<&str> = pipeline.stages.iter().map(|s| s.command_name()).collect();
        kinds.sort_unstable();
        kinds.dedup();

        let mut missing = Vec::new();
        for kind in kinds {
            match self.executors.get(kind) {
                Some(executor) if executor.check_available().await => {}
                _ => missing.push(kind.to_string()),
            }
        }
        missing
    }

    /// Stages whose registered executor rejects them, such as a shell stage
    /// naming a shell that is not installed. Stages with no executor are
    /// left to `missing_executors`.
    pub fn invalid_stages(&self, pipeline: &PipelineDefinition) -> Vec<(String, GantryError)> {
        pipeline
            .stages
            .iter()
            .filter_map(|stage| {
                let executor = self.get(stage.command_name())?;
                executor
                    .validate_stage(stage)
                    .err()
                    .map(|err| (stage.id.clone(), err))
            })
            .collect()
    }

    /// Check every stage against its executor's own validation
    pub fn validate_stages(&self, pipeline: &PipelineDefinition) -> Result<(), GantryError> {
        for stage in &pipeline.stages {
            let executor = self.get(stage.command_name()).ok_or_else(|| {
                GantryError::ExecutorNotFound {
                    command: stage.command_name().to_string(),
                }
            })?;
            executor.validate_stage(stage)?;
        }
        Ok(())
    }
}

/// Resolve glob patterns to file paths, failing on patterns that match nothing
pub fn resolve_globs(
    stage: &str,
    patterns: &[String],
    base_dir: &Path,
) -> Result<Vec<PathBuf>, GantryError> {
    let mut files = Vec::new();

    for pattern in patterns {
        let full_pattern = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            base_dir.join(pattern).to_string_lossy().to_string()
        };

        let mut matches: Vec<_> = glob::glob(&full_pattern)?
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .collect();

        if matches.is_empty() {
            return Err(GantryError::MissingOutput {
                stage: stage.to_string(),
                pattern: pattern.to_string(),
            });
        }

        matches.sort();
        files.extend(matches);
    }

    Ok(files)
}
