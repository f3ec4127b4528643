// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Error recovery suggestions
//!
//! Provides actionable suggestions for recovering from pipeline load errors.

use super::GantryError;

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Suggest fixing a circular dependency
    pub fn fix_circular_dependency(stages: &[String]) -> Self {
        Self {
            action: "Remove circular dependency".into(),
            steps: vec![
                format!("Detected cycle: {}", stages.join(" → ")),
                "Review the depends_on lists of these stages".into(),
                "Ensure stages form a directed acyclic graph (DAG)".into(),
            ],
            commands: vec![
                "# Visualize your pipeline:".into(),
                "gantry graph --format mermaid".into(),
            ],
        }
    }

    /// Suggest fixing a reference to a stage that does not exist
    pub fn fix_unknown_dependency(stage: &str, dependency: &str) -> Self {
        Self {
            action: format!("Fix the dependency '{}' of stage '{}'", dependency, stage),
            steps: vec![
                format!("Stage '{}' lists '{}' in depends_on", stage, dependency),
                "Either define that stage or remove the reference".into(),
            ],
            commands: vec!["gantry validate".into()],
        }
    }

    /// Suggest fixing an unrecognized key
    pub fn fix_unknown_field(field: &str) -> Self {
        Self {
            action: format!("Remove or rename '{}'", field),
            steps: vec![
                "Stage keys: id, command, depends_on, timeout_seconds, retry, gate,".into(),
                "            outputs, report, env, when, allow_failure, description".into(),
                "Retry keys: max_attempts, base_delay_ms, max_delay_ms".into(),
                "Gate keys:  block_on, max_count".into(),
            ],
            commands: vec!["gantry validate".into()],
        }
    }

    /// Pick a suggestion for an error, if one applies
    pub fn for_error(error: &GantryError) -> Option<Self> {
        match error {
            GantryError::CircularDependency { stages } => Some(Self::fix_circular_dependency(stages)),
            GantryError::UnknownDependency { stage, dependency } => {
                Some(Self::fix_unknown_dependency(stage, dependency))
            }
            GantryError::UnknownField { field, .. } => Some(Self::fix_unknown_field(field)),
            _ => None,
        }
    }

    /// Format the suggestion for terminal output
    pub fn format(&self) -> String {
        let mut out = format!("{}\n", self.action);
        for step in &self.steps {
            out.push_str(&format!("  • {}\n", step));
        }
        if !self.commands.is_empty() {
            out.push('\n');
            for command in &self.commands {
                out.push_str(&format!("    {}\n", command));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_for_cycle() {
        let err = GantryError::CircularDependency {
            stages: vec!["a".into(), "b".into(), "a".into()],
        };
        let suggestion = RecoverySuggestion::for_error(&err).unwrap();
        assert!(suggestion.format().contains("a → b → a"));
    }

    #[test]
    fn test_no_suggestion_for_runtime_errors() {
        let err = GantryError::transient("registry", "timeout");
        assert!(RecoverySuggestion::for_error(&err).is_none());
    }
}
