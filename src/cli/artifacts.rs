// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Artifacts command - inspect and collect the artifact store

use chrono::Utc;
use colored::Colorize;
use miette::Result;
use std::process::ExitCode;

use super::ArtifactsAction;
use crate::artifacts::{ArtifactStore, FilesystemArtifactStore};
use crate::config::EngineConfig;
use crate::utils::format_age;

/// Run the artifacts command
pub async fn run(action: ArtifactsAction, config: EngineConfig, _verbose: bool) -> Result<ExitCode> {
    let store = FilesystemArtifactStore::new(config.artifact_dir.clone())?;

    match action {
        ArtifactsAction::Stats => {
            let stats = store.stats().await?;

            println!("{}", "Artifact Store".bold());
            println!("{}", "═".repeat(40));
            println!("  Location: {}", config.artifact_dir.display());
            println!("  Runs:     {}", stats.runs);
            println!("  Blobs:    {}", stats.blobs);
            println!("  Size:     {}", stats.formatted_size());

            let now = Utc::now();
            if let Some(oldest) = stats.oldest_run {
                if let Ok(age) = (now - oldest).to_std() {
                    println!("  Oldest:   {} ago", format_age(age));
                }
            }
            if let Some(newest) = stats.newest_run {
                if let Ok(age) = (now - newest).to_std() {
                    println!("  Newest:   {} ago", format_age(age));
                }
            }
        }

        ArtifactsAction::List { run } => {
            let artifacts = store.list(&run).await?;

            println!("{}", format!("Artifacts of run {}", run).bold());
            println!("{}", "═".repeat(40));

            if artifacts.is_empty() {
                println!("{}", "  No artifacts recorded.".dimmed());
            }
            for artifact in &artifacts {
                println!(
                    "  {}/{} {} {}",
                    artifact.stage_id,
                    artifact.name,
                    format!("{} bytes", artifact.size).dimmed(),
                    store.blob_path(artifact).display().to_string().dimmed()
                );
            }
        }

        ArtifactsAction::Gc {
            max_runs,
            ttl_hours,
        } => {
            let mut policy = config.retention.clone();
            if max_runs.is_some() {
                policy.max_runs = max_runs;
            }
            if ttl_hours.is_some() {
                policy.ttl_hours = ttl_hours;
            }

            if policy.max_runs.is_none() && policy.ttl_hours.is_none() {
                println!(
                    "{}",
                    "No retention policy configured; nothing to collect.".dimmed()
                );
                return Ok(ExitCode::SUCCESS);
            }

            // Runs in flight in other processes are not known here
            let report = store.gc(&policy, &Default::default()).await?;

            if report.runs_removed.is_empty() && report.blobs_removed == 0 {
                println!("{}", "Nothing to collect.".dimmed());
            } else {
                println!(
                    "{} Removed {} run(s) and {} blob(s), freed {} bytes",
                    "✓".green(),
                    report.runs_removed.len(),
                    report.blobs_removed,
                    report.bytes_freed
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
