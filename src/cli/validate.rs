// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Validate command - check pipeline configuration

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::process::ExitCode;

use super::EXIT_CONFIG;
use crate::executors::ExecutorRegistry;
use crate::pipeline::{PipelineDefinition, PipelineValidator};

/// Run the validate command
pub async fn run(pipeline_path: PathBuf, verbose: bool) -> Result<ExitCode> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    let pipeline = match PipelineDefinition::from_file(&pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  {} Failed to parse {}", "✗".red(), pipeline_path.display());
            eprintln!();
            return Err(e.into());
        }
    };

    println!("  {} Pipeline file parses", "✓".green());

    let validation = PipelineValidator::validate(&pipeline);
    let registry = ExecutorRegistry::with_defaults();
    let missing = registry.missing_executors(&pipeline).await;
    let invalid = registry.invalid_stages(&pipeline);

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if !validation.warnings.is_empty() || !missing.is_empty() || !invalid.is_empty() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
        for kind in &missing {
            println!(
                "  {} no executor available for '{}' stages on this machine",
                "⚠".yellow(),
                kind
            );
        }
        for (stage, err) in &invalid {
            println!("  {} stage '{}' cannot run here: {}", "⚠".yellow(), stage, err);
        }
    }

    if verbose {
        println!();
        println!("{}:", "Pipeline summary".bold());
        println!("  Name: {}", pipeline.name);
        println!("  Timeout: {}s", pipeline.timeout_seconds);
        println!("  Stages: {}", pipeline.stages.len());
        for stage in &pipeline.stages {
            let deps = if stage.depends_on.is_empty() {
                String::new()
            } else {
                format!(" [depends: {}]", stage.depends_on.join(", "))
            };
            let gate = if stage.gate.is_some() { " [gated]" } else { "" };
            println!(
                "    - {} ({}){}{}",
                stage.id,
                stage.command_name(),
                deps.dimmed(),
                gate.dimmed()
            );
        }
    }

    println!();

    if !validation.is_valid() {
        eprintln!("{}", "Pipeline validation failed".red().bold());
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    if validation.has_warnings() || !missing.is_empty() || !invalid.is_empty() {
        println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
    } else {
        println!("{}", "Pipeline is valid!".green().bold());
    }
    Ok(ExitCode::SUCCESS)
}
