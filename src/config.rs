// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Engine configuration
//!
//! Settings for the engine itself, as opposed to a pipeline: where artifacts
//! live, how much runs in parallel, and how long artifacts are kept. Loaded
//! from `gantry.toml`; every key is optional.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::artifacts::RetentionPolicy;
use crate::errors::GantryError;

/// Default configuration file name, looked up in the working directory
pub const CONFIG_FILE: &str = "gantry.toml";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Root directory of the artifact store
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Stages of one run executing at the same time
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Stages executing at the same time across all runs
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// A new push for a pipeline and source ref cancels the run in flight
    #[serde(default = "default_supersede")]
    pub supersede: bool,

    /// Artifact retention
    #[serde(default)]
    pub retention: RetentionPolicy,
}

fn default_artifact_dir() -> PathBuf {
    ProjectDirs::from("dev", "gantry", "gantry")
        .map(|dirs| dirs.data_dir().join("artifacts"))
        .unwrap_or_else(|| PathBuf::from(".gantry/artifacts"))
}

fn default_max_parallelism() -> usize {
    4
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
}

fn default_supersede() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            max_parallelism: default_max_parallelism(),
            workers: default_workers(),
            supersede: default_supersede(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `gantry.toml` in the
    /// working directory is used if present, else the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, GantryError> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => {
                let candidate = Path::new(CONFIG_FILE);
                if candidate.exists() {
                    Self::load_from_path(candidate)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific file path
    pub fn load_from_path(path: &Path) -> Result<Self, GantryError> {
        let contents = std::fs::read_to_string(path).map_err(|e| GantryError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config = Self::from_toml(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, GantryError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GantryError> {
        if self.max_parallelism == 0 {
            return Err(GantryError::InvalidConfig {
                message: "max_parallelism must be at least 1".to_string(),
            });
        }
        if self.workers == 0 {
            return Err(GantryError::InvalidConfig {
                message: "workers must be at least 1".to_string(),
            });
        }
        if self.retention.max_runs == Some(0) {
            return Err(GantryError::InvalidConfig {
                message: "retention.max_runs must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, GantryError> {
        toml::to_string_pretty(self).map_err(|e| GantryError::InvalidConfig {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallelism, 4);
        assert!(config.workers >= 1);
        assert!(config.supersede);
        assert_eq!(config.retention, RetentionPolicy::default());
        assert!(config.artifact_dir.ends_with("artifacts"));
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
artifact_dir = "/var/lib/gantry"
max_parallelism = 2
supersede = false

[retention]
ttl_hours = 72
max_runs = 20
"#,
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.artifact_dir, PathBuf::from("/var/lib/gantry"));
        assert_eq!(config.max_parallelism, 2);
        assert!(!config.supersede);
        assert_eq!(config.retention.ttl_hours, Some(72));
        assert_eq!(config.retention.max_runs, Some(20));
        assert_eq!(config.workers, default_workers());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = EngineConfig::from_toml("max_paralelism = 2").unwrap_err();
        assert!(matches!(err, GantryError::Toml { .. }));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        let err = EngineConfig::from_toml("max_parallelism = 0").unwrap_err();
        assert!(matches!(err, GantryError::InvalidConfig { .. }));
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let result = EngineConfig::load(Some(Path::new("/nonexistent/gantry.toml")));
        assert!(matches!(result, Err(GantryError::FileReadError { .. })));
    }

    #[test]
    fn test_round_trip() {
        let config = EngineConfig {
            artifact_dir: PathBuf::from("/tmp/artifacts"),
            ..EngineConfig::default()
        };
        let parsed = EngineConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
