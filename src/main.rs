// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! gantry - staged, gated CI/CD pipeline orchestrator

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry::cli::{self, Cli, Commands};
use gantry::errors::GantryError;
use gantry::pipeline::TriggerEvent;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise -v raises gantry's own logs to info
    let default_filter = if cli.verbose { "gantry=info" } else { "gantry=warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if !gantry::utils::should_use_colors() {
        colored::control::set_override(false);
    }

    match dispatch(cli).await {
        Ok(code) => code,
        Err(report) => cli::report_error(report),
    }
}

async fn dispatch(cli: Cli) -> miette::Result<ExitCode> {
    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| GantryError::Io {
            message: format!("Failed to change to directory '{}': {}", dir.display(), e),
        })?;
    }

    let verbose = cli.verbose;
    let config = cli.engine_config()?;

    match cli.command {
        Commands::Run {
            pipeline,
            source_ref,
            trigger,
            max_parallelism,
            dry_run,
        } => {
            let event = TriggerEvent {
                source_ref,
                trigger,
            };
            cli::run::run(pipeline, event, max_parallelism, dry_run, config, verbose).await
        }
        Commands::Validate { pipeline } => cli::validate::run(pipeline, verbose).await,
        Commands::Graph { pipeline, format } => cli::graph::run(pipeline, format, verbose).await,
        Commands::Artifacts { action } => cli::artifacts::run(action, config, verbose).await,
    }
}
