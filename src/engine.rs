// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Run engine
//!
//! Owns the artifact store, the executor registry and the worker pool shared
//! by every run. Each triggered run gets its own coordinator task; the engine
//! keeps a handle to cancel it and a channel of status snapshots.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{watch, Semaphore};

use crate::artifacts::{ArtifactStore, FilesystemArtifactStore, GcReport};
use crate::config::EngineConfig;
use crate::errors::GantryError;
use crate::executors::{ExecutorRegistry, StageRunner};
use crate::pipeline::{
    PipelineDefinition, PipelineRun, PipelineValidator, RunCoordinator, RunId, Scheduler,
    TriggerEvent, TriggerType,
};

struct RunHandle {
    pipeline: String,
    event: TriggerEvent,
    snapshots: watch::Receiver<PipelineRun>,
    control: watch::Sender<Option<String>>,
}

impl RunHandle {
    fn is_finished(&self) -> bool {
        self.snapshots.borrow().is_finished()
    }
}

/// Pipeline run engine
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    runner: StageRunner,
    workers: Arc<Semaphore>,
    working_dir: PathBuf,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
}

impl Engine {
    /// Create an engine over an existing store
    pub fn new(
        config: EngineConfig,
        registry: ExecutorRegistry,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            config: Arc::new(config),
            runner: StageRunner::new(registry, store),
            workers,
            working_dir: PathBuf::from("."),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create an engine with a filesystem store at the configured directory
    pub fn from_config(config: EngineConfig, registry: ExecutorRegistry) -> Result<Self, GantryError> {
        let store = FilesystemArtifactStore::new(config.artifact_dir.clone())?;
        Ok(Self::new(config, registry, Arc::new(store)))
    }

    /// Directory stages run in
    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ArtifactStore> {
        self.runner.store()
    }

    /// Start a run and return its id without waiting for it.
    ///
    /// Invalid definitions are rejected before a run exists. Must be called
    /// from within a Tokio runtime.
    pub fn trigger(
        &self,
        definition: Arc<PipelineDefinition>,
        event: TriggerEvent,
    ) -> Result<RunId, GantryError> {
        PipelineValidator::validate(&definition).into_result()?;
        let scheduler = Scheduler::new(definition.clone(), self.config.max_parallelism)?;

        let run_id = RunId::new();
        if self.config.supersede && event.trigger == TriggerType::Push {
            self.supersede(&definition.name, &event, &run_id);
        }

        let run = PipelineRun::new(run_id.clone(), &definition, event.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(run.clone());
        let (control_tx, control_rx) = watch::channel(None);

        let coordinator = RunCoordinator::new(
            run,
            scheduler,
            self.runner.clone(),
            self.workers.clone(),
            self.working_dir.clone(),
            snapshot_tx,
        );

        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                run_id.clone(),
                RunHandle {
                    pipeline: definition.name.clone(),
                    event,
                    snapshots: snapshot_rx,
                    control: control_tx,
                },
            );

        tokio::spawn(coordinator.run(control_rx));
        tracing::debug!(%run_id, pipeline = %definition.name, "Run triggered");

        Ok(run_id)
    }

    /// Cancel in-flight pushes of the same pipeline and source ref
    fn supersede(&self, pipeline: &str, event: &TriggerEvent, by: &RunId) {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        for (id, handle) in runs.iter() {
            if handle.pipeline == pipeline
                && handle.event.source_ref == event.source_ref
                && handle.event.trigger == TriggerType::Push
                && !handle.is_finished()
            {
                tracing::info!(run_id = %id, superseded_by = %by, "Superseding run");
                handle
                    .control
                    .send_replace(Some(format!("superseded by run {}", by)));
            }
        }
    }

    /// Snapshot of a run: every stage's state plus the verdict once finished
    pub fn status(&self, run_id: &RunId) -> Option<PipelineRun> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        runs.get(run_id).map(|handle| handle.snapshots.borrow().clone())
    }

    /// Receiver that sees every snapshot the coordinator publishes
    pub fn subscribe(&self, run_id: &RunId) -> Option<watch::Receiver<PipelineRun>> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        runs.get(run_id).map(|handle| handle.snapshots.clone())
    }

    /// Wait for a run to finish and return its final state
    pub async fn wait(&self, run_id: &RunId) -> Result<PipelineRun, GantryError> {
        let mut snapshots = self
            .subscribe(run_id)
            .ok_or_else(|| GantryError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        if let Ok(run) = snapshots.wait_for(PipelineRun::is_finished).await {
            return Ok(run.clone());
        }

        // Coordinator is gone; its last snapshot is all there is
        let run = snapshots.borrow().clone();
        Ok(run)
    }

    /// Request cancellation of a run. Cancelling a finished run does nothing.
    pub fn cancel(&self, run_id: &RunId, reason: impl Into<String>) -> Result<(), GantryError> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let handle = runs.get(run_id).ok_or_else(|| GantryError::RunNotFound {
            run_id: run_id.to_string(),
        })?;

        let reason = reason.into();
        handle.control.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        Ok(())
    }

    /// Runs that have not reached a verdict
    pub fn in_flight(&self) -> HashSet<RunId> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        runs.iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Apply artifact retention, never touching runs in flight
    pub async fn gc(&self) -> Result<GcReport, GantryError> {
        let in_flight = self.in_flight();
        let report = self.store().gc(&self.config.retention, &in_flight).await?;
        tracing::info!(
            runs_removed = report.runs_removed.len(),
            blobs_removed = report.blobs_removed,
            bytes_freed = report.bytes_freed,
            "Artifact gc finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::RetentionPolicy;
    use crate::pipeline::dag::tests::make_test_pipeline;
    use crate::pipeline::{Command, Interrupt, RunVerdict, StageState};
    use tempfile::TempDir;

    fn engine(dir: &TempDir, config: EngineConfig) -> Engine {
        let store = Arc::new(FilesystemArtifactStore::new(dir.path().join("store")).unwrap());
        Engine::new(config, ExecutorRegistry::with_defaults(), store).with_working_dir(dir.path())
    }

    fn slow_pipeline() -> Arc<PipelineDefinition> {
        let mut definition = make_test_pipeline(vec![("deploy", vec![]), ("verify", vec!["deploy"])]);
        definition.stages[0].command = Command::shell("sleep 30");
        Arc::new(definition)
    }

    async fn wait_until_running(engine: &Engine, run_id: &RunId, stage: &str) {
        engine
            .subscribe(run_id)
            .unwrap()
            .wait_for(|run| run.state_of(stage).is_some_and(StageState::is_executing))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_trigger_and_wait() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, EngineConfig::default());
        let definition = Arc::new(make_test_pipeline(vec![("a", vec![]), ("b", vec!["a"])]));

        let run_id = engine.trigger(definition, TriggerEvent::push("main")).unwrap();
        let run = engine.wait(&run_id).await.unwrap();

        assert_eq!(run.verdict(), Some(RunVerdict::Succeeded));
        assert_eq!(engine.status(&run_id).unwrap().verdict(), Some(RunVerdict::Succeeded));
        assert!(engine.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_definition_creates_no_run() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, EngineConfig::default());
        let definition = Arc::new(make_test_pipeline(vec![("a", vec!["b"]), ("b", vec!["a"])]));

        let err = engine
            .trigger(definition, TriggerEvent::push("main"))
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(engine.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, EngineConfig::default());

        let run_id = engine
            .trigger(slow_pipeline(), TriggerEvent::manual("main"))
            .unwrap();
        wait_until_running(&engine, &run_id, "deploy").await;
        engine.cancel(&run_id, "operator request").unwrap();

        let run = engine.wait(&run_id).await.unwrap();
        assert_eq!(run.verdict(), Some(RunVerdict::Cancelled));
        assert_eq!(
            run.interrupt,
            Some(Interrupt::Cancelled {
                reason: "operator request".into()
            })
        );
        assert!(matches!(
            engine.cancel(&RunId::new(), "nope"),
            Err(GantryError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_new_push_supersedes_run_for_same_ref() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, EngineConfig::default());

        let first = engine
            .trigger(slow_pipeline(), TriggerEvent::push("refs/heads/main"))
            .unwrap();
        wait_until_running(&engine, &first, "deploy").await;

        let other_ref = engine
            .trigger(slow_pipeline(), TriggerEvent::push("refs/heads/feature"))
            .unwrap();
        let second = engine
            .trigger(slow_pipeline(), TriggerEvent::push("refs/heads/main"))
            .unwrap();

        let first_run = engine.wait(&first).await.unwrap();
        assert_eq!(first_run.verdict(), Some(RunVerdict::Cancelled));

        let in_flight = engine.in_flight();
        assert!(in_flight.contains(&second));
        assert!(in_flight.contains(&other_ref));

        for id in [second, other_ref] {
            engine.cancel(&id, "test cleanup").unwrap();
            engine.wait(&id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_gc_spares_in_flight_runs() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            retention: RetentionPolicy {
                ttl_hours: None,
                max_runs: Some(1),
            },
            ..EngineConfig::default()
        };
        let engine = engine(&dir, config);
        let quick = Arc::new(make_test_pipeline(vec![("a", vec![])]));

        for _ in 0..2 {
            let id = engine.trigger(quick.clone(), TriggerEvent::manual("main")).unwrap();
            engine.wait(&id).await.unwrap();
        }
        let running = engine
            .trigger(slow_pipeline(), TriggerEvent::manual("main"))
            .unwrap();
        wait_until_running(&engine, &running, "deploy").await;

        let report = engine.gc().await.unwrap();
        assert_eq!(report.runs_removed.len(), 1);
        assert!(!report.runs_removed.contains(&running));

        engine.cancel(&running, "test cleanup").unwrap();
        engine.wait(&running).await.unwrap();
    }
}
