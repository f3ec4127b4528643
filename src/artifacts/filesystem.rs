// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Filesystem-based artifact store
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/<first 2 hex chars>/<hash>
//! runs/<run id>/index.json
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{hash_bytes, ArtifactRef, ArtifactStore, GcReport, RetentionPolicy, StoreStats};
use crate::errors::GantryError;
use crate::pipeline::RunId;

/// Per-run index of stored artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunIndex {
    run_id: RunId,
    created_at: DateTime<Utc>,
    artifacts: Vec<ArtifactRef>,
}

/// Filesystem-based artifact store
pub struct FilesystemArtifactStore {
    root: PathBuf,
    /// Serializes index updates and GC
    write_lock: Mutex<()>,
}

impl FilesystemArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: PathBuf) -> Result<Self, GantryError> {
        for dir in [root.join("blobs"), root.join("runs")] {
            std::fs::create_dir_all(&dir).map_err(|e| GantryError::ArtifactStore {
                message: format!("Failed to create {}: {}", dir.display(), e),
            })?;
        }

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn hash_path(&self, hash: &str) -> PathBuf {
        // Use first 2 chars as directory for better filesystem performance
        let prefix = &hash[..2.min(hash.len())];
        self.root.join("blobs").join(prefix).join(hash)
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join("runs").join(run_id.to_string())
    }

    fn index_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("index.json")
    }

    async fn load_index(&self, run_id: &RunId) -> Result<Option<RunIndex>, GantryError> {
        let path = self.index_path(run_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            GantryError::ArtifactStore {
                message: format!("Failed to read run index {}: {}", path.display(), e),
            }
        })?;

        let index = serde_json::from_str(&content).map_err(|e| GantryError::ArtifactStore {
            message: format!("Failed to parse run index {}: {}", path.display(), e),
        })?;

        Ok(Some(index))
    }

    async fn save_index(&self, index: &RunIndex) -> Result<(), GantryError> {
        let dir = self.run_dir(&index.run_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| GantryError::ArtifactStore {
            message: format!("Failed to create run directory: {}", e),
        })?;

        let json = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.index_path(&index.run_id), &json).await
    }

    /// Read every run index, skipping unreadable ones
    async fn all_indices(&self) -> Result<Vec<RunIndex>, GantryError> {
        let mut indices = Vec::new();
        let runs_dir = self.root.join("runs");

        let mut entries = tokio::fs::read_dir(&runs_dir).await.map_err(|e| {
            GantryError::ArtifactStore {
                message: format!("Failed to read runs directory: {}", e),
            }
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let Some(run_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<RunId>().ok())
            else {
                continue;
            };

            match self.load_index(&run_id).await {
                Ok(Some(index)) => indices.push(index),
                Ok(None) => {}
                Err(e) => tracing::warn!(run = %run_id, error = %e, "Skipping unreadable run index"),
            }
        }

        Ok(indices)
    }

    /// Every blob file as (hash, path, size)
    async fn all_blobs(&self) -> Result<Vec<(String, PathBuf, u64)>, GantryError> {
        let mut blobs = Vec::new();
        let mut prefixes = tokio::fs::read_dir(self.root.join("blobs")).await?;

        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }

            let mut files = tokio::fs::read_dir(prefix.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let Some(name) = file.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if name.contains(".tmp") {
                    continue;
                }
                let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
                blobs.push((name, file.path(), size));
            }
        }

        Ok(blobs)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GantryError> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, bytes).await.map_err(|e| GantryError::ArtifactStore {
        message: format!("Failed to write {}: {}", tmp.display(), e),
    })?;

    tokio::fs::rename(&tmp, path).await.map_err(|e| GantryError::ArtifactStore {
        message: format!("Failed to move {} into place: {}", path.display(), e),
    })
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn put(
        &self,
        run_id: &RunId,
        stage_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRef, GantryError> {
        let hash = hash_bytes(bytes);
        let _guard = self.write_lock.lock().await;

        let mut index = self.load_index(run_id).await?.unwrap_or_else(|| RunIndex {
            run_id: run_id.clone(),
            created_at: Utc::now(),
            artifacts: Vec::new(),
        });

        if let Some(existing) = index
            .artifacts
            .iter()
            .find(|a| a.stage_id == stage_id && a.name == name)
        {
            if existing.hash == hash {
                return Ok(existing.clone());
            }
            return Err(GantryError::ArtifactConflict {
                stage: stage_id.to_string(),
                name: name.to_string(),
            });
        }

        let blob = self.hash_path(&hash);
        if blob.exists() {
            tracing::debug!(hash = %hash, "Blob already stored, deduplicated");
        } else {
            if let Some(parent) = blob.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            write_atomic(&blob, bytes).await?;
        }

        let artifact = ArtifactRef {
            run_id: run_id.clone(),
            stage_id: stage_id.to_string(),
            name: name.to_string(),
            hash,
            size: bytes.len() as u64,
        };

        index.artifacts.push(artifact.clone());
        self.save_index(&index).await?;

        tracing::debug!(artifact = %artifact, size = artifact.size, "Stored artifact");
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, GantryError> {
        let path = self.hash_path(&artifact.hash);

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GantryError::ArtifactNotFound {
                    reference: artifact.to_string(),
                })
            }
            Err(e) => Err(GantryError::ArtifactStore {
                message: format!("Failed to read blob {}: {}", path.display(), e),
            }),
        }
    }

    fn blob_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.hash_path(&artifact.hash)
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>, GantryError> {
        Ok(self
            .load_index(run_id)
            .await?
            .map(|index| index.artifacts)
            .unwrap_or_default())
    }

    async fn gc(
        &self,
        policy: &RetentionPolicy,
        in_flight: &HashSet<RunId>,
    ) -> Result<GcReport, GantryError> {
        let _guard = self.write_lock.lock().await;
        let mut report = GcReport::default();

        let mut indices = self.all_indices().await?;
        // Newest first so the run-count cap keeps the most recent runs
        indices.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let now = Utc::now();
        let ttl = policy.ttl();
        let mut kept = Vec::new();
        let mut finished_seen = 0usize;

        for index in indices {
            if in_flight.contains(&index.run_id) {
                kept.push(index);
                continue;
            }

            finished_seen += 1;
            let over_cap = policy.max_runs.is_some_and(|max| finished_seen > max);
            let expired = ttl.is_some_and(|ttl| {
                (now - index.created_at)
                    .to_std()
                    .map(|age| age > ttl)
                    .unwrap_or(false)
            });

            if over_cap || expired {
                let dir = self.run_dir(&index.run_id);
                tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
                    GantryError::ArtifactStore {
                        message: format!("Failed to remove {}: {}", dir.display(), e),
                    }
                })?;
                tracing::info!(run = %index.run_id, "Collected run artifacts");
                report.runs_removed.push(index.run_id);
            } else {
                kept.push(index);
            }
        }

        let referenced: HashSet<&str> = kept
            .iter()
            .flat_map(|index| index.artifacts.iter().map(|a| a.hash.as_str()))
            .collect();

        for (hash, path, size) in self.all_blobs().await? {
            if referenced.contains(hash.as_str()) {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
            report.blobs_removed += 1;
            report.bytes_freed += size;
        }

        Ok(report)
    }

    async fn stats(&self) -> Result<StoreStats, GantryError> {
        let indices = self.all_indices().await?;
        let blobs = self.all_blobs().await?;

        Ok(StoreStats {
            runs: indices.len(),
            blobs: blobs.len(),
            size_bytes: blobs.iter().map(|(_, _, size)| size).sum(),
            oldest_run: indices.iter().map(|i| i.created_at).min(),
            newest_run: indices.iter().map(|i| i.created_at).max(),
        })
    }
}
