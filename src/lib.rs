// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! # gantry - Staged CI/CD Pipeline Orchestrator
//!
//! `gantry` runs a pipeline of stages (build, image, publish, deploy, scan
//! or plain shell) as a dependency graph. Stages pass artifacts to each
//! other through a content-addressed store, and security gates decide from
//! scan findings whether dependents may proceed.
//!
//! ## Features
//!
//! - **DAG scheduling** - Independent stages run in parallel up to a bound
//! - **Gates** - Findings at blocking severity stop dependents; others are advisory
//! - **Retries** - Per-stage exponential backoff for transient failures
//! - **Artifacts** - Write-once, hash-verified, with retention
//! - **Cancellation** - Explicit, superseding pushes and global timeouts
//!
//! ## Quick Start
//!
//! ```bash
//! # Check the pipeline
//! gantry validate
//!
//! # Show the plan
//! gantry run --dry-run
//!
//! # Run it
//! gantry run --source-ref main --trigger push
//! ```

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executors;
pub mod gate;
pub mod pipeline;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{GantryError, GantryResult};
pub use pipeline::{PipelineDefinition, PipelineRun, RunId, RunVerdict, TriggerEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
