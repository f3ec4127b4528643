// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Run command - execute the pipeline

use colored::Colorize;
use miette::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use super::{EXIT_CONFIG, EXIT_FAILED};
use crate::artifacts::ArtifactStore;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::errors::GantryError;
use crate::executors::ExecutorRegistry;
use crate::gate::GateVerdict;
use crate::pipeline::{
    DagBuilder, Interrupt, PipelineDefinition, PipelineRun, PipelineValidator, RunId,
    SkipReason, StageRun, StageState, TriggerEvent, TriggerType,
};
use crate::utils::{self, create_spinner, format_elapsed};

/// Lines of stderr shown for the failing stage
const STDERR_TAIL: usize = 20;

/// Run the pipeline
pub async fn run(
    pipeline_path: PathBuf,
    event: TriggerEvent,
    max_parallelism: Option<usize>,
    dry_run: bool,
    mut config: EngineConfig,
    verbose: bool,
) -> Result<ExitCode> {
    let pipeline = PipelineDefinition::from_file(&pipeline_path)?;

    let validation = PipelineValidator::validate(&pipeline);
    if !validation.is_valid() {
        eprintln!("{}", "Pipeline validation failed:".red().bold());
        for error in &validation.errors {
            eprintln!("  {} {}", "✗".red(), error);
        }
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    if validation.has_warnings() && verbose {
        eprintln!("{}", "Pipeline warnings:".yellow().bold());
        for warning in &validation.warnings {
            eprintln!("  {} {}", "⚠".yellow(), warning);
        }
        eprintln!();
    }

    if let Some(max) = max_parallelism {
        if max == 0 {
            return Err(GantryError::InvalidConfig {
                message: "--max-parallelism must be at least 1".to_string(),
            }
            .into());
        }
        config.max_parallelism = max;
    }

    let registry = ExecutorRegistry::with_defaults();
    let missing = registry.missing_executors(&pipeline).await;
    let invalid = registry.invalid_stages(&pipeline);

    if dry_run {
        print_plan(&pipeline, &event, &config)?;
        for kind in &missing {
            utils::print_warning(&format!("no executor available for '{}' stages", kind));
        }
        for (stage, err) in &invalid {
            utils::print_warning(&format!("stage '{}' cannot run here: {}", stage, err));
        }
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(first) = missing.first() {
        eprintln!("{}", "Missing executors:".red().bold());
        for kind in &missing {
            eprintln!("  {} {}", "✗".red(), kind);
        }
        return Err(GantryError::ExecutorNotFound {
            command: first.clone(),
        }
        .into());
    }

    if !invalid.is_empty() {
        eprintln!("{}", "Stages that cannot run here:".red().bold());
        for (stage, err) in &invalid {
            eprintln!("  {} {}: {}", "✗".red(), stage, err);
        }
        if let Some((_, err)) = invalid.into_iter().next() {
            return Err(err.into());
        }
    }

    let working_dir = std::env::current_dir().map_err(|e| GantryError::Io {
        message: format!("Failed to get current directory: {}", e),
    })?;

    let engine = Engine::from_config(config, registry)?.with_working_dir(working_dir);
    let pipeline = Arc::new(pipeline);
    let run_id = engine.trigger(pipeline.clone(), event.clone())?;

    println!(
        "{} {} {}",
        "Running pipeline".bold(),
        pipeline.name.cyan().bold(),
        format!("({} {}, run {})", event.trigger, event.source_ref, run_id).dimmed()
    );
    println!();

    let run = follow(&engine, &run_id).await?;
    print_summary(&engine, &run, verbose).await;

    Ok(match run.verdict() {
        Some(verdict) if verdict.is_success() => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_FAILED),
    })
}

/// Stream stage completions until the run finishes; ctrl-c cancels the run
async fn follow(engine: &Engine, run_id: &RunId) -> Result<PipelineRun> {
    let mut snapshots = engine
        .subscribe(run_id)
        .ok_or_else(|| GantryError::RunNotFound {
            run_id: run_id.to_string(),
        })?;

    let spinner = create_spinner("Starting...");
    let mut reported = HashSet::new();
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let run = snapshots.borrow_and_update().clone();
                report_finished(&spinner, &run, &mut reported);
                if run.is_finished() {
                    break;
                }
                let running: Vec<&str> = run
                    .stages
                    .iter()
                    .filter(|s| s.state.is_executing())
                    .map(|s| s.stage_id.as_str())
                    .collect();
                if !cancel_requested && !running.is_empty() {
                    spinner.set_message(format!("Running {}", running.join(", ")));
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                engine.cancel(run_id, "interrupted by user")?;
                spinner.set_message("Cancelling...");
            }
        }
    }

    let run = engine.wait(run_id).await?;
    report_finished(&spinner, &run, &mut reported);
    spinner.finish_and_clear();
    Ok(run)
}

fn report_finished(
    spinner: &indicatif::ProgressBar,
    run: &PipelineRun,
    reported: &mut HashSet<String>,
) {
    for stage in &run.stages {
        if stage.state.is_terminal() && reported.insert(stage.stage_id.clone()) {
            spinner.suspend(|| println!("{}", stage_line(stage)));
        }
    }
}

fn stage_line(stage: &StageRun) -> String {
    let mut line = format!("  {} {}", utils::stage_symbol(stage.state), stage.stage_id);

    let mut details = Vec::new();
    if let Some(duration) = stage.duration() {
        if stage.state != StageState::Skipped {
            details.push(format_elapsed(duration));
        }
    }
    if stage.attempts.len() > 1 {
        details.push(format!("{} attempts", stage.attempts.len()));
    }
    match (&stage.state, &stage.skip_reason, &stage.failure) {
        (StageState::Skipped, Some(SkipReason::Blocked { by }), _) => {
            details.push(format!("blocked by {}", by))
        }
        (StageState::Skipped, Some(SkipReason::Condition), _) => {
            details.push("condition not met".to_string())
        }
        (StageState::Skipped, Some(SkipReason::Halted), _) => details.push("not run".to_string()),
        (StageState::FailedFatal | StageState::FailedAdvisory, _, Some(failure)) => {
            details.push(failure.to_string())
        }
        _ => {}
    }
    if let Some(GateVerdict::AdvisoryFail { findings }) = stage.verdict {
        details.push(format!("{} advisory finding(s)", findings));
    }

    if !details.is_empty() {
        line.push_str(&format!(" {}", format!("({})", details.join(", ")).dimmed()));
    }
    line
}

async fn print_summary(engine: &Engine, run: &PipelineRun, verbose: bool) {
    let summary = run.summary();
    let Some(verdict) = summary.verdict else {
        return;
    };

    println!();
    println!("{}", utils::verdict(verdict));

    match &summary.interrupt {
        Some(Interrupt::Cancelled { reason }) => println!("  Cancelled: {}", reason),
        Some(Interrupt::TimedOut { seconds }) => {
            println!("  Pipeline timed out after {}s", seconds)
        }
        None => {}
    }

    if let Some((stage_id, failure)) = &summary.primary_failure {
        println!(
            "  {} stage '{}' {}",
            "Primary failure:".red().bold(),
            stage_id,
            failure
        );
        if let Some(stage) = run.stage(stage_id) {
            print_stderr_tail(engine, stage).await;
        }
    }

    let lists = [
        ("Blocked", &summary.blocked),
        ("Not run", &summary.not_run),
        ("Cancelled", &summary.cancelled),
        ("Advisories", &summary.advisories),
    ];
    for (label, stages) in lists {
        if !stages.is_empty() {
            println!("  {}: {}", label, stages.join(", "));
        }
    }

    if verbose {
        println!();
        println!("  {}", format!("Run id: {}", run.id).dimmed());
        let artifacts: usize = run.stages.iter().map(|s| s.artifacts.len()).sum();
        if artifacts > 0 {
            println!(
                "  {}",
                format!("{} artifact(s); list with 'gantry artifacts list {}'", artifacts, run.id)
                    .dimmed()
            );
        }
    }
}

/// Last lines of the final attempt's stderr
async fn print_stderr_tail(engine: &Engine, stage: &StageRun) {
    let Some(log) = stage
        .attempts
        .last()
        .and_then(|attempt| attempt.logs.iter().find(|log| log.name.ends_with("stderr")))
    else {
        return;
    };

    let bytes = match engine.store().get(log).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "Could not read stage log");
            return;
        }
    };

    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return;
    }

    println!();
    for line in &lines[lines.len().saturating_sub(STDERR_TAIL)..] {
        println!("    {}", line.dimmed());
    }
}

fn print_plan(
    pipeline: &PipelineDefinition,
    event: &TriggerEvent,
    config: &EngineConfig,
) -> Result<()> {
    let dag = DagBuilder::build(pipeline)?;

    utils::print_header(&format!("Execution plan for '{}'", pipeline.name));
    println!("  Source:      {}", event.source_ref);
    println!("  Trigger:     {}", event.trigger);
    println!("  Parallelism: {}", config.max_parallelism);
    println!("  Timeout:     {}s", pipeline.timeout_seconds);
    if event.trigger == TriggerType::Push && config.supersede {
        println!(
            "  {}",
            "A newer push of this source ref cancels the run.".dimmed()
        );
    }

    utils::print_section("Stages");
    for line in dag.to_text(pipeline).lines() {
        println!("  {}", line);
    }

    let gated: Vec<&str> = pipeline
        .stages
        .iter()
        .filter(|s| s.gate.is_some())
        .map(|s| s.id.as_str())
        .collect();
    if !gated.is_empty() {
        utils::print_section("Gated stages");
        for id in gated {
            utils::print_info(id);
        }
    }

    println!();
    println!("{}", "Dry run; nothing was executed.".dimmed());
    Ok(())
}
