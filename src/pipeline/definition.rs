// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Pipeline definition structures
//!
//! Defines the schema for gantry.yaml files. Every struct rejects unknown
//! keys so a typo fails at load instead of silently dropping a setting.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::GantryError;
use crate::gate::GatePolicy;
use crate::pipeline::PipelineValidator;

/// Pipeline definition from gantry.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    /// Pipeline version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Stages in declaration order
    pub stages: Vec<StageDefinition>,

    /// Global timeout, also the default per-stage timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Global environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_version() -> String {
    "1".to_string()
}

fn default_timeout_seconds() -> u64 {
    3600
}

impl PipelineDefinition {
    /// Load, parse and validate a pipeline file
    pub fn load(path: &Path) -> Result<Self, GantryError> {
        let pipeline = Self::from_file(path)?;
        PipelineValidator::validate(&pipeline).into_result()?;
        Ok(pipeline)
    }

    /// Read and parse a pipeline file without validating it
    pub fn from_file(path: &Path) -> Result<Self, GantryError> {
        if !path.exists() {
            return Err(GantryError::PipelineNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| GantryError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_yaml(&content)
    }

    /// Parse pipeline from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, GantryError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Parse and validate a pipeline from YAML string
    pub fn parse(yaml: &str) -> Result<Self, GantryError> {
        let pipeline = Self::from_yaml(yaml)?;
        PipelineValidator::validate(&pipeline).into_result()?;
        Ok(pipeline)
    }

    /// Serialize pipeline to YAML
    pub fn to_yaml(&self) -> Result<String, GantryError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get a stage by id
    pub fn get_stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Get all stage ids in declaration order
    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id.as_str()).collect()
    }

    /// Timeout for a stage, falling back to the pipeline timeout
    pub fn stage_timeout(&self, stage: &StageDefinition) -> Duration {
        Duration::from_secs(stage.timeout_seconds.unwrap_or(self.timeout_seconds))
    }
}

/// A single pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    /// Stage id (must be unique within pipeline)
    pub id: String,

    /// Stage description
    #[serde(default)]
    pub description: Option<String>,

    /// What the stage runs
    pub command: Command,

    /// Stage dependencies (other stage ids)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Per-stage timeout; the pipeline timeout applies when absent
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Gate policy applied to the stage's findings
    #[serde(default)]
    pub gate: Option<GatePolicy>,

    /// Glob patterns of files stored as artifacts after the stage passes
    #[serde(default)]
    pub outputs: Vec<String>,

    /// JSON findings report written by the stage
    #[serde(default)]
    pub report: Option<PathBuf>,

    /// Environment variables for this stage
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Condition for running this stage
    #[serde(default)]
    pub when: Option<StageCondition>,

    /// A failure of this stage is recorded as advisory
    #[serde(default)]
    pub allow_failure: bool,
}

impl StageDefinition {
    /// Get the command kind for this stage
    pub fn command_name(&self) -> &'static str {
        self.command.kind()
    }
}

/// Command descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum Command {
    /// Shell command run as a subprocess
    Shell {
        /// Script passed to the shell
        run: String,

        /// Shell to use (bash, sh, etc.)
        #[serde(default = "default_shell")]
        shell: String,
    },

    /// Build the triggering source ref with the build tool
    Build {},

    /// Build a container image from the upstream build artifact
    Image {
        /// Image manifest (Dockerfile or equivalent)
        manifest: String,
    },

    /// Push the upstream image to the registry
    Publish {},

    /// Apply manifests to the cluster
    Deploy {
        /// Manifest set to apply
        manifests: Vec<String>,
    },

    /// Scan a target with the vulnerability scanner
    Scan {
        /// Scan target; the upstream image ref when absent
        #[serde(default)]
        target: Option<String>,
    },
}

fn default_shell() -> String {
    "bash".to_string()
}

impl Command {
    /// Executor registry key for this command
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "shell",
            Self::Build {} => "build",
            Self::Image { .. } => "image",
            Self::Publish {} => "publish",
            Self::Deploy { .. } => "deploy",
            Self::Scan { .. } => "scan",
        }
    }

    /// Shorthand for a bash shell command
    pub fn shell(run: impl Into<String>) -> Self {
        Self::Shell {
            run: run.into(),
            shell: default_shell(),
        }
    }
}

/// Retry policy for a stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempts and base delay
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Backoff before the retry that follows `failed_attempt` (1-based):
    /// base × 2^(failed_attempt - 1), capped at `max_delay_ms`
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// How a run was started
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Push,
    Manual,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown trigger type: {}", s)),
        }
    }
}

/// Condition for running a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageCondition {
    /// Run only if file exists (relative to the working directory)
    FileExists(PathBuf),
    /// Run only if environment variable is set
    EnvSet(String),
    /// Run only if environment variable equals value
    EnvEquals { var: String, value: String },
    /// Run only for this trigger type
    Trigger(TriggerType),
    /// Always run (default)
    Always,
    /// Never run (skip)
    Never,
}

impl StageCondition {
    /// Evaluate the condition for a run
    pub fn holds(
        &self,
        working_dir: &Path,
        env: &HashMap<String, String>,
        trigger: TriggerType,
    ) -> bool {
        let lookup = |var: &str| env.get(var).cloned().or_else(|| std::env::var(var).ok());
        match self {
            Self::FileExists(path) => working_dir.join(path).exists(),
            Self::EnvSet(var) => lookup(var).is_some(),
            Self::EnvEquals { var, value } => lookup(var).as_deref() == Some(value.as_str()),
            Self::Trigger(expected) => *expected == trigger,
            Self::Always => true,
            Self::Never => false,
        }
    }
}
