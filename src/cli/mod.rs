// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for gantry. Handlers return the
//! process exit code: 0 when a run succeeds (advisories included), 1 when it
//! fails or is cancelled, and 2 when the configuration is invalid.

pub mod artifacts;
pub mod graph;
pub mod run;
pub mod validate;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::config::EngineConfig;
use crate::errors::{GantryError, RecoverySuggestion};
use crate::pipeline::{RunId, TriggerType};

/// Default pipeline file name
pub const PIPELINE_FILE: &str = "gantry.yaml";

/// Staged, gated CI/CD pipeline orchestrator
#[derive(Parser, Debug)]
#[clap(
    name = "gantry",
    version,
    about = "Staged, gated, artifact-passing CI/CD pipeline orchestrator",
    long_about = None,
    after_help = "Examples:\n\
        gantry validate                     Check gantry.yaml\n\
        gantry run --source-ref main        Run the pipeline\n\
        gantry graph --format mermaid       Show the stage graph\n\
        gantry artifacts gc                 Apply artifact retention\n\n\
        See 'gantry <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Engine configuration file (defaults to ./gantry.toml when present)
    #[clap(long, global = true, env = "GANTRY_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Artifact store directory, overriding the configuration
    #[clap(long, global = true, env = "GANTRY_ARTIFACT_DIR", value_name = "DIR")]
    pub artifact_dir: Option<PathBuf>,
}

impl Cli {
    /// Engine configuration with command-line overrides applied
    pub fn engine_config(&self) -> Result<EngineConfig, GantryError> {
        let mut config = EngineConfig::load(self.config.as_deref())?;
        if let Some(dir) = &self.artifact_dir {
            config.artifact_dir = dir.clone();
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline
    Run {
        /// Pipeline file
        #[clap(short, long, default_value = PIPELINE_FILE)]
        pipeline: PathBuf,

        /// Branch, tag or commit being built
        #[clap(long, default_value = "HEAD")]
        source_ref: String,

        /// What triggered the run (push, manual)
        #[clap(long, default_value = "manual")]
        trigger: TriggerType,

        /// Stages of this run executing at the same time
        #[clap(long)]
        max_parallelism: Option<usize>,

        /// Show the execution plan without running anything
        #[clap(long)]
        dry_run: bool,
    },

    /// Validate pipeline configuration
    Validate {
        /// Pipeline file to validate
        #[clap(default_value = PIPELINE_FILE)]
        pipeline: PathBuf,
    },

    /// Show pipeline as a graph
    Graph {
        /// Pipeline file
        #[clap(default_value = PIPELINE_FILE)]
        pipeline: PathBuf,

        /// Output format (text, dot, mermaid)
        #[clap(short, long, default_value = "text")]
        format: GraphFormat,
    },

    /// Artifact store management
    Artifacts {
        #[clap(subcommand)]
        action: ArtifactsAction,
    },
}

/// Artifact store actions
#[derive(Subcommand, Debug, Clone)]
pub enum ArtifactsAction {
    /// Show store statistics
    Stats,

    /// List the artifacts of a run
    List {
        /// Run id
        run: RunId,
    },

    /// Apply the retention policy
    Gc {
        /// Keep only this many runs, overriding the configuration
        #[clap(long)]
        max_runs: Option<usize>,

        /// Remove runs older than this many hours, overriding the configuration
        #[clap(long)]
        ttl_hours: Option<u64>,
    },
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

impl std::str::FromStr for GraphFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "dot" => Ok(Self::Dot),
            "mermaid" => Ok(Self::Mermaid),
            _ => Err(format!("Unknown graph format: {}", s)),
        }
    }
}

/// Exit code for a failed or cancelled run
pub const EXIT_FAILED: u8 = 1;

/// Exit code for invalid configuration
pub const EXIT_CONFIG: u8 = 2;

/// Print an error with any recovery hint and map it to an exit code
pub fn report_error(report: miette::Report) -> ExitCode {
    let gantry_error = report.downcast_ref::<GantryError>();
    let is_config = gantry_error.is_some_and(GantryError::is_config_error);
    let suggestion = gantry_error.and_then(RecoverySuggestion::for_error);

    eprintln!("{:?}", report);
    if let Some(suggestion) = suggestion {
        eprintln!("{}", suggestion.format().yellow());
    }

    ExitCode::from(if is_config { EXIT_CONFIG } else { EXIT_FAILED })
}
