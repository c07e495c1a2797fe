//! Publish step: package the built site, then deploy it.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, instrument};

use bookship_artifacts::PackagedArtifact;
use bookship_deploy::{DeployOptions, PagesClient, TokenSource};
use bookship_shared::{BookshipError, DeploymentResult, PublishConfig, Result, RunId, RunStep};

use crate::build::DirGuard;
use crate::context::ExecutionContext;
use crate::retry::{RetryPolicy, retry_async};

const ARTIFACT_FILE: &str = "artifact.tar.gz";

/// Turns a site directory into a deployable artifact.
#[async_trait]
pub trait ArtifactPackager: Send + Sync {
    async fn package(&self, site_dir: &Path, dest: &Path) -> Result<PackagedArtifact>;
}

/// Submits an artifact to the hosting service.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        artifact: &PackagedArtifact,
        build_version: &str,
    ) -> Result<DeploymentResult>;
}

/// gzip'd tarball packager.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarballPackager;

#[async_trait]
impl ArtifactPackager for TarballPackager {
    async fn package(&self, site_dir: &Path, dest: &Path) -> Result<PackagedArtifact> {
        let site_dir = site_dir.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || bookship_artifacts::package_site(&site_dir, &dest))
            .await
            .map_err(|e| BookshipError::packaging(format!("packaging task failed: {e}")))?
    }
}

/// Deploys through the hosting API.
///
/// Endpoint and credentials are resolved at deploy time, so a dry run never
/// needs them.
#[derive(Debug, Clone)]
pub struct PagesDeployer {
    publish: PublishConfig,
}

impl PagesDeployer {
    pub fn new(publish: PublishConfig) -> Self {
        Self { publish }
    }
}

#[async_trait]
impl Deployer for PagesDeployer {
    async fn deploy(
        &self,
        artifact: &PackagedArtifact,
        build_version: &str,
    ) -> Result<DeploymentResult> {
        let opts = DeployOptions::from_config(&self.publish).map_err(as_deployment)?;
        let token = TokenSource::from_env(&self.publish)?;
        let client = PagesClient::new(opts)?;
        client.deploy(artifact, build_version, &token).await
    }
}

/// Setup failures while preparing a deployment are still deployment failures.
fn as_deployment(err: BookshipError) -> BookshipError {
    if err.step() == RunStep::Publish {
        err
    } else {
        BookshipError::deployment_rejected(err.to_string())
    }
}

/// Package `site_dir` and deploy it, retrying the deployment per `retry`.
///
/// The artifact lives in the run's scratch directory, which is removed when
/// this returns.
#[instrument(skip_all, fields(run = %run_id.short(), site = %site_dir.display(), version = %build_version))]
pub async fn publish_site(
    ctx: &ExecutionContext,
    run_id: &RunId,
    site_dir: &Path,
    build_version: &str,
    packager: &dyn ArtifactPackager,
    deployer: &dyn Deployer,
    retry: &RetryPolicy,
) -> Result<DeploymentResult> {
    let scratch = DirGuard::new(ctx.run_dir(run_id));
    let artifact = packager
        .package(site_dir, &scratch.path().join(ARTIFACT_FILE))
        .await?;
    info!(
        sha256 = %artifact.sha256,
        size_bytes = artifact.size_bytes,
        files = artifact.file_count,
        "artifact ready"
    );

    let result = retry_async(retry, "deploy", || deployer.deploy(&artifact, build_version)).await?;

    info!(
        url = %result.public_url,
        deployment_id = %result.deployment_id,
        "site published"
    );
    Ok(result)
}
