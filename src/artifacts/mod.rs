// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Content-addressed artifact storage
//!
//! Stage outputs, logs and scan reports are stored once per content hash and
//! indexed per run. A `(run, stage, name)` slot can only ever hold one hash.

mod filesystem;
mod hash;

pub use filesystem::FilesystemArtifactStore;
pub use hash::{hash_bytes, short_hash};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::GantryError;
use crate::pipeline::RunId;

/// Immutable handle to stored bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub run_id: RunId,
    pub stage_id: String,
    pub name: String,
    /// BLAKE3 hash of the content
    pub hash: String,
    pub size: u64,
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.run_id,
            self.stage_id,
            self.name,
            short_hash(&self.hash)
        )
    }
}

/// Trait for artifact store implementations
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes for a stage of a run.
    ///
    /// Storing identical bytes again returns the existing ref; different
    /// bytes under the same name fail with `ArtifactConflict`.
    async fn put(
        &self,
        run_id: &RunId,
        stage_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRef, GantryError>;

    /// Fetch the bytes behind a ref
    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, GantryError>;

    /// Location of the blob on disk, for handing inputs to subprocesses
    fn blob_path(&self, artifact: &ArtifactRef) -> PathBuf;

    /// All artifacts recorded for a run
    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>, GantryError>;

    /// Apply the retention policy; runs in `in_flight` are never touched
    async fn gc(
        &self,
        policy: &RetentionPolicy,
        in_flight: &HashSet<RunId>,
    ) -> Result<GcReport, GantryError>;

    /// Get store statistics
    async fn stats(&self) -> Result<StoreStats, GantryError>;
}

/// Artifact retention settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    /// Runs older than this are collected
    #[serde(default)]
    pub ttl_hours: Option<u64>,

    /// Only the newest `max_runs` runs are kept
    #[serde(default)]
    pub max_runs: Option<usize>,
}

impl RetentionPolicy {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_hours.map(|h| Duration::from_secs(h * 3600))
    }
}

/// What a GC pass removed
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcReport {
    pub runs_removed: Vec<RunId>,
    pub blobs_removed: usize,
    pub bytes_freed: u64,
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of indexed runs
    pub runs: usize,
    /// Number of distinct blobs
    pub blobs: usize,
    /// Total blob size in bytes
    pub size_bytes: u64,
    /// Oldest run timestamp
    pub oldest_run: Option<DateTime<Utc>>,
    /// Newest run timestamp
    pub newest_run: Option<DateTime<Utc>>,
}

impl StoreStats {
    /// Format size for display
    pub fn formatted_size(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.size_bytes >= GB {
            format!("{:.2} GB", self.size_bytes as f64 / GB as f64)
        } else if self.size_bytes >= MB {
            format!("{:.2} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.2} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", self.size_bytes)
        }
    }
}
