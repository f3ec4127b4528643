// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Graph command - visualize pipeline as a graph

use miette::Result;
use std::path::PathBuf;
use std::process::ExitCode;

use super::GraphFormat;
use crate::pipeline::{DagBuilder, PipelineDefinition};

/// Run the graph command
pub async fn run(pipeline_path: PathBuf, format: GraphFormat, _verbose: bool) -> Result<ExitCode> {
    let pipeline = PipelineDefinition::from_file(&pipeline_path)?;
    let dag = DagBuilder::build(&pipeline)?;

    let output = match format {
        GraphFormat::Text => dag.to_text(&pipeline),
        GraphFormat::Dot => dag.to_dot(),
        GraphFormat::Mermaid => dag.to_mermaid(),
    };

    print!("{}", output);

    Ok(ExitCode::SUCCESS)
}
