// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! External collaborators
//!
//! Build tools, image builders, registries, clusters and scanners are only
//! reached through these narrow traits. Each executor here adapts one of
//! them to the `Executor` interface so it can be retried, timed out and
//! gated like a shell stage.

use async_trait::async_trait;
use std::sync::Arc;

use super::{ExecutionContext, ExecutionOutput, Executor, ProducedArtifact};
use crate::errors::GantryError;
use crate::gate::Finding;
use crate::pipeline::{Command, StageDefinition};

/// Artifact name for the output of a build stage
pub const BUILD_ARTIFACT: &str = "artifact";

/// Artifact name holding an image reference
pub const IMAGE_REF_ARTIFACT: &str = "image-ref";

/// Builds a source ref into a deployable artifact
#[async_trait]
pub trait BuildTool: Send + Sync {
    async fn build(&self, source_ref: &str) -> Result<Vec<u8>, GantryError>;
}

/// Builds a container image and returns its reference
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_image(&self, artifact: &[u8], manifest: &str) -> Result<String, GantryError>;
}

/// Registry push failures
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PushError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),
}

impl From<PushError> for GantryError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::Auth(message) => GantryError::Auth {
                collaborator: "registry".to_string(),
                message,
            },
            PushError::Network(message) => GantryError::transient("registry", message),
        }
    }
}

/// Pushes images to a registry, returning the pushed digest
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn push(&self, image: &str) -> Result<String, PushError>;
}

/// State of a rollout after manifests were applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStatus {
    Complete,
    Progressing,
    Failed(String),
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn apply_manifests(&self, manifests: &[String]) -> Result<RolloutStatus, GantryError>;
}

#[async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    async fn scan(&self, target: &str) -> Result<Vec<Finding>, GantryError>;
}

fn wrong_command(stage: &StageDefinition, expected: &str) -> GantryError {
    GantryError::InvalidStage {
        stage: stage.id.clone(),
        reason: format!("Expected {} command, found {}", expected, stage.command_name()),
    }
}

async fn read_text_input(ctx: &ExecutionContext, name: &str) -> Result<String, GantryError> {
    let bytes = ctx.read_input(name).await?;
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

/// Runs `build` stages through a [`BuildTool`]
pub struct BuildExecutor {
    tool: Arc<dyn BuildTool>,
}

impl BuildExecutor {
    pub fn new(tool: Arc<dyn BuildTool>) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl Executor for BuildExecutor {
    async fn execute(
        &self,
        stage: &StageDefinition,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, GantryError> {
        if !matches!(stage.command, Command::Build {}) {
            return Err(wrong_command(stage, "build"));
        }

        let bytes = self.tool.build(&ctx.event.source_ref).await?;
        Ok(ExecutionOutput::success(format!(
            "built {} ({} bytes)",
            ctx.event.source_ref,
            bytes.len()
        ))
        .with_artifact(ProducedArtifact::new(BUILD_ARTIFACT, bytes)))
    }

    async fn check_available(&self) -> bool {
        true
    }

    fn validate_stage(&self, stage: &StageDefinition) -> Result<(), GantryError> {
        match stage.command {
            Command::Build {} => Ok(()),
            _ => Err(wrong_command(stage, "build")),
        }
    }
}

/// Runs `image` stages: upstream build artifact in, image reference out
pub struct ImageExecutor {
    builder: Arc<dyn ImageBuilder>,
}

impl ImageExecutor {
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl Executor for ImageExecutor {
    async fn execute(
        &self,
        stage: &StageDefinition,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, GantryError> {
        let Command::Image { manifest } = &stage.command else {
            return Err(wrong_command(stage, "image"));
        };

        let artifact = ctx.read_input(BUILD_ARTIFACT).await?;
        let image = self.builder.build_image(&artifact, manifest).await?;

        Ok(ExecutionOutput::success(format!("built image {}", image))
            .with_artifact(ProducedArtifact::new(IMAGE_REF_ARTIFACT, image.into_bytes())))
    }

    async fn check_available(&self) -> bool {
        true
    }

    fn validate_stage(&self, stage: &StageDefinition) -> Result<(), GantryError> {
        match &stage.command {
            Command::Image { manifest } if manifest.trim().is_empty() => {
                Err(GantryError::InvalidStage {
                    stage: stage.id.clone(),
                    reason: "Image manifest is empty".to_string(),
                })
            }
            Command::Image { .. } => Ok(()),
            _ => Err(wrong_command(stage, "image")),
        }
    }
}

/// Runs `publish` stages: pushes the upstream image reference
pub struct PublishExecutor {
    registry: Arc<dyn RegistryClient>,
}

impl PublishExecutor {
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Executor for PublishExecutor {
    async fn execute(
        &self,
        stage: &StageDefinition,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, GantryError> {
        if !matches!(stage.command, Command::Publish {}) {
            return Err(wrong_command(stage, "publish"));
        }

        let image = read_text_input(ctx, IMAGE_REF_ARTIFACT).await?;
        let digest = self.registry.push(&image).await?;

        Ok(ExecutionOutput::success(format!("pushed {} ({})", image, digest))
            .with_artifact(ProducedArtifact::new("digest", digest.into_bytes())))
    }

    async fn check_available(&self) -> bool {
        true
    }

    fn validate_stage(&self, stage: &StageDefinition) -> Result<(), GantryError> {
        match stage.command {
            Command::Publish {} => Ok(()),
            _ => Err(wrong_command(stage, "publish")),
        }
    }
}

/// Runs `deploy` stages against a cluster
pub struct DeployExecutor {
    cluster: Arc<dyn ClusterClient>,
}

impl DeployExecutor {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Executor for DeployExecutor {
    async fn execute(
        &self,
        stage: &StageDefinition,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, GantryError> {
        let Command::Deploy { manifests } = &stage.command else {
            return Err(wrong_command(stage, "deploy"));
        };

        match self.cluster.apply_manifests(manifests).await? {
            RolloutStatus::Complete => Ok(ExecutionOutput::success(format!(
                "rolled out {} manifest(s)",
                manifests.len()
            ))),
            // Still converging: retry after backoff
            RolloutStatus::Progressing => Err(GantryError::transient(
                "cluster",
                "rollout still progressing",
            )),
            RolloutStatus::Failed(reason) => {
                Ok(ExecutionOutput::failure(1, format!("rollout failed: {}", reason)))
            }
        }
    }

    async fn check_available(&self) -> bool {
        true
    }

    fn validate_stage(&self, stage: &StageDefinition) -> Result<(), GantryError> {
        match &stage.command {
            Command::Deploy { manifests } if manifests.is_empty() => {
                Err(GantryError::InvalidStage {
                    stage: stage.id.clone(),
                    reason: "Deploy stage lists no manifests".to_string(),
                })
            }
            Command::Deploy { .. } => Ok(()),
            _ => Err(wrong_command(stage, "deploy")),
        }
    }
}

/// Runs `scan` stages; findings are left to the stage's gate policy
pub struct ScanExecutor {
    scanner: Arc<dyn VulnerabilityScanner>,
}

impl ScanExecutor {
    pub fn new(scanner: Arc<dyn VulnerabilityScanner>) -> Self {
        Self { scanner }
    }
}

#[async_trait]
impl Executor for ScanExecutor {
    async fn execute(
        &self,
        stage: &StageDefinition,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, GantryError> {
        let Command::Scan { target } = &stage.command else {
            return Err(wrong_command(stage, "scan"));
        };

        let target = match target {
            Some(target) => target.clone(),
            None => read_text_input(ctx, IMAGE_REF_ARTIFACT).await?,
        };

        let findings = self.scanner.scan(&target).await?;
        tracing::debug!(stage = %stage.id, %target, findings = findings.len(), "Scan finished");

        Ok(
            ExecutionOutput::success(format!("scanned {}: {} finding(s)", target, findings.len()))
                .with_findings(findings),
        )
    }

    async fn check_available(&self) -> bool {
        true
    }

    fn validate_stage(&self, stage: &StageDefinition) -> Result<(), GantryError> {
        match stage.command {
            Command::Scan { .. } => Ok(()),
            _ => Err(wrong_command(stage, "scan")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactStore, FilesystemArtifactStore};
    use crate::gate::Severity;
    use crate::pipeline::dag::tests::make_stage;
    use crate::pipeline::{RunId, TriggerEvent};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeBuild;

    #[async_trait]
    impl BuildTool for FakeBuild {
        async fn build(&self, source_ref: &str) -> Result<Vec<u8>, GantryError> {
            Ok(format!("jar for {}", source_ref).into_bytes())
        }
    }

    struct FakeImages;

    #[async_trait]
    impl ImageBuilder for FakeImages {
        async fn build_image(&self, artifact: &[u8], manifest: &str) -> Result<String, GantryError> {
            assert!(!artifact.is_empty());
            Ok(format!("registry.local/app:{}", manifest.len()))
        }
    }

    struct FakeRegistry {
        outcome: Result<String, PushError>,
        pushed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RegistryClient for FakeRegistry {
        async fn push(&self, image: &str) -> Result<String, PushError> {
            self.pushed.lock().unwrap().push(image.to_string());
            self.outcome.clone()
        }
    }

    struct FakeCluster(RolloutStatus);

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn apply_manifests(&self, _: &[String]) -> Result<RolloutStatus, GantryError> {
            Ok(self.0.clone())
        }
    }

    struct FakeScanner;

    #[async_trait]
    impl VulnerabilityScanner for FakeScanner {
        async fn scan(&self, target: &str) -> Result<Vec<Finding>, GantryError> {
            Ok(vec![Finding::new(Severity::High, format!("CVE-in-{}", target))])
        }
    }

    fn stage(command: Command) -> StageDefinition {
        let mut stage = make_stage("stage", &[]);
        stage.command = command;
        stage
    }

    async fn context_with(dir: &TempDir, inputs: &[(&str, &str)]) -> ExecutionContext {
        let store: Arc<dyn ArtifactStore> =
            Arc::new(FilesystemArtifactStore::new(dir.path().to_path_buf()).unwrap());
        let run_id = RunId::new();
        let mut refs = Vec::new();
        for (name, content) in inputs {
            refs.push(
                store
                    .put(&run_id, "upstream", name, content.as_bytes())
                    .await
                    .unwrap(),
            );
        }
        ExecutionContext {
            run_id,
            event: TriggerEvent::push("v1.2.0"),
            working_dir: dir.path().to_path_buf(),
            env: HashMap::new(),
            inputs: refs,
            store,
        }
    }

    #[tokio::test]
    async fn test_build_then_image() {
        let dir = TempDir::new().unwrap();
        let ctx = context_with(&dir, &[]).await;

        let built = BuildExecutor::new(Arc::new(FakeBuild))
            .execute(&stage(Command::Build {}), &ctx)
            .await
            .unwrap();
        assert_eq!(built.produced[0].name, BUILD_ARTIFACT);
        assert_eq!(built.produced[0].bytes, b"jar for v1.2.0");

        let ctx = context_with(&dir, &[(BUILD_ARTIFACT, "jar")]).await;
        let image = ImageExecutor::new(Arc::new(FakeImages))
            .execute(
                &stage(Command::Image {
                    manifest: "Dockerfile".into(),
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(image.produced[0].name, IMAGE_REF_ARTIFACT);
    }

    #[tokio::test]
    async fn test_image_without_build_artifact() {
        let dir = TempDir::new().unwrap();
        let ctx = context_with(&dir, &[]).await;

        let result = ImageExecutor::new(Arc::new(FakeImages))
            .execute(
                &stage(Command::Image {
                    manifest: "Dockerfile".into(),
                }),
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(GantryError::MissingInput { .. })));
    }

    #[tokio::test]
    async fn test_publish_classifies_push_errors() {
        let dir = TempDir::new().unwrap();
        let ctx = context_with(&dir, &[(IMAGE_REF_ARTIFACT, "app:1\n")]).await;

        let ok = Arc::new(FakeRegistry {
            outcome: Ok("sha256:abc".into()),
            pushed: Mutex::new(vec![]),
        });
        let output = PublishExecutor::new(ok.clone())
            .execute(&stage(Command::Publish {}), &ctx)
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(*ok.pushed.lock().unwrap(), vec!["app:1"]);

        let auth = PublishExecutor::new(Arc::new(FakeRegistry {
            outcome: Err(PushError::Auth("denied".into())),
            pushed: Mutex::new(vec![]),
        }));
        let err = auth.execute(&stage(Command::Publish {}), &ctx).await.unwrap_err();
        assert!(matches!(err, GantryError::Auth { .. }));
        assert!(!err.is_retryable());

        let network = PublishExecutor::new(Arc::new(FakeRegistry {
            outcome: Err(PushError::Network("reset".into())),
            pushed: Mutex::new(vec![]),
        }));
        let err = network
            .execute(&stage(Command::Publish {}), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_deploy_rollout_statuses() {
        let dir = TempDir::new().unwrap();
        let ctx = context_with(&dir, &[]).await;
        let deploy = stage(Command::Deploy {
            manifests: vec!["k8s/app.yaml".into()],
        });

        let complete = DeployExecutor::new(Arc::new(FakeCluster(RolloutStatus::Complete)));
        assert_eq!(complete.execute(&deploy, &ctx).await.unwrap().exit_code, 0);

        let failed = DeployExecutor::new(Arc::new(FakeCluster(RolloutStatus::Failed(
            "crashloop".into(),
        ))));
        let output = failed.execute(&deploy, &ctx).await.unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(output.stderr.contains("crashloop"));

        let progressing = DeployExecutor::new(Arc::new(FakeCluster(RolloutStatus::Progressing)));
        let err = progressing.execute(&deploy, &ctx).await.unwrap_err();
        assert!(matches!(err, GantryError::TransientInfra { .. }));
    }

    #[tokio::test]
    async fn test_scan_defaults_to_upstream_image() {
        let dir = TempDir::new().unwrap();
        let ctx = context_with(&dir, &[(IMAGE_REF_ARTIFACT, "app:2")]).await;

        let output = ScanExecutor::new(Arc::new(FakeScanner))
            .execute(&stage(Command::Scan { target: None }), &ctx)
            .await
            .unwrap();

        assert_eq!(output.findings.len(), 1);
        assert_eq!(output.findings[0].id, "CVE-in-app:2");
    }

    #[test]
    fn test_validate_rejects_mismatched_commands() {
        let deploy = DeployExecutor::new(Arc::new(FakeCluster(RolloutStatus::Complete)));
        assert!(deploy.validate_stage(&stage(Command::Publish {})).is_err());
        assert!(deploy
            .validate_stage(&stage(Command::Deploy { manifests: vec![] }))
            .is_err());
    }
}
