//! Static hosting deployment client.
//!
//! A deployment is three calls against the hosting API:
//! 1. upload the packaged site (`POST {endpoint}/artifacts`)
//! 2. create a deployment for that artifact (`POST {endpoint}/deployments`)
//! 3. poll `GET {endpoint}/deployments/{id}` until it goes live or fails
//!
//! The final `page_url` becomes the run's [`DeploymentResult`].

mod token;

use std::time::{Duration, Instant};

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use bookship_artifacts::PackagedArtifact;
use bookship_shared::{BookshipError, DeploymentResult, PublishConfig, Result};

pub use token::TokenSource;

/// Default timeout in seconds for a single HTTP request.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// User-Agent string for deployment requests.
const USER_AGENT: &str = concat!("bookship/", env!("CARGO_PKG_VERSION"));

/// Statuses the hosting service reports for a deployment that will never go live.
const FAILED_STATUSES: &[&str] = &[
    "deployment_failed",
    "deployment_content_failed",
    "deployment_cancelled",
    "deployment_lost",
    "failed",
];

const SUCCESS_STATUS: &str = "succeed";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for the deployment client.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// API base, without trailing slash.
    pub endpoint: String,
    pub artifact_name: String,
    /// Bearer token for the hosting API.
    pub api_token: Option<String>,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub request_timeout_secs: u64,
}

impl DeployOptions {
    /// Build options from `[publish]`, reading the API token from its env var.
    pub fn from_config(publish: &PublishConfig) -> Result<Self> {
        Ok(Self {
            endpoint: publish.resolve_endpoint()?,
            artifact_name: publish.artifact_name.clone(),
            api_token: std::env::var(&publish.api_token_env)
                .ok()
                .filter(|v| !v.is_empty()),
            poll_interval: Duration::from_millis(publish.poll_interval_ms),
            max_wait: Duration::from_secs(publish.max_wait_secs),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateDeploymentRequest<'a> {
    artifact_id: &'a str,
    pages_build_version: &'a str,
    oidc_token: &'a str,
}

/// A deployment accepted by the hosting service but not yet live.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentHandle {
    pub id: String,
    #[serde(default)]
    pub status_url: Option<String>,
    pub page_url: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the hosting deployment API.
pub struct PagesClient {
    client: Client,
    opts: DeployOptions,
}

impl PagesClient {
    pub fn new(opts: DeployOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(opts.request_timeout_secs))
            .build()
            .map_err(|e| {
                BookshipError::deployment_rejected(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { client, opts })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.opts.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Upload the packaged site and return the artifact id.
    #[instrument(skip_all, fields(artifact = %artifact.path.display(), size = artifact.size_bytes))]
    pub async fn upload_artifact(&self, artifact: &PackagedArtifact) -> Result<String> {
        let body = tokio::fs::read(&artifact.path).await.map_err(|e| {
            BookshipError::deployment_rejected(format!(
                "failed to read {}: {e}",
                artifact.path.display()
            ))
        })?;

        let url = format!("{}/artifacts", self.opts.endpoint);
        let response = self
            .authorized(self.client.post(&url))
            .query(&[("name", self.opts.artifact_name.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .header("X-Artifact-Sha256", &artifact.sha256)
            .body(body)
            .send()
            .await
            .map_err(|e| BookshipError::deployment(format!("{url}: {e}")))?;

        let uploaded: UploadResponse = parse_json(&url, response).await?;
        info!(artifact_id = %uploaded.id, "artifact uploaded");
        Ok(uploaded.id)
    }

    /// Ask the service to deploy an uploaded artifact.
    #[instrument(skip_all, fields(artifact_id = %artifact_id))]
    pub async fn create_deployment(
        &self,
        artifact_id: &str,
        build_version: &str,
        oidc_token: &str,
    ) -> Result<DeploymentHandle> {
        let url = format!("{}/deployments", self.opts.endpoint);
        let request = CreateDeploymentRequest {
            artifact_id,
            pages_build_version: build_version,
            oidc_token,
        };

        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| BookshipError::deployment(format!("{url}: {e}")))?;

        let handle: DeploymentHandle = parse_json(&url, response).await?;
        info!(deployment_id = %handle.id, page_url = %handle.page_url, "deployment created");
        Ok(handle)
    }

    /// Poll until the deployment succeeds, fails, or `max_wait` elapses.
    #[instrument(skip_all, fields(deployment_id = %handle.id))]
    pub async fn wait_for_deployment(&self, handle: &DeploymentHandle) -> Result<()> {
        let url = match &handle.status_url {
            Some(status_url) => status_url.clone(),
            None => format!("{}/deployments/{}", self.opts.endpoint, handle.id),
        };
        let start = Instant::now();

        loop {
            let response = self
                .authorized(self.client.get(&url))
                .send()
                .await
                .map_err(|e| BookshipError::deployment(format!("{url}: {e}")))?;
            let status: StatusResponse = parse_json(&url, response).await?;

            if status.status == SUCCESS_STATUS {
                info!(elapsed_ms = start.elapsed().as_millis(), "deployment live");
                return Ok(());
            }
            if FAILED_STATUSES.contains(&status.status.as_str()) {
                return Err(BookshipError::deployment_rejected(format!(
                    "deployment {} ended with status '{}'",
                    handle.id, status.status
                )));
            }

            debug!(status = %status.status, "deployment in progress");

            if start.elapsed() + self.opts.poll_interval > self.opts.max_wait {
                return Err(BookshipError::deployment(format!(
                    "deployment {} not live after {}s (last status '{}')",
                    handle.id,
                    self.opts.max_wait.as_secs(),
                    status.status
                )));
            }
            tokio::time::sleep(self.opts.poll_interval).await;
        }
    }

    /// Upload, create, and wait for a deployment.
    #[instrument(skip_all, fields(endpoint = %self.opts.endpoint))]
    pub async fn deploy(
        &self,
        artifact: &PackagedArtifact,
        build_version: &str,
        token: &TokenSource,
    ) -> Result<DeploymentResult> {
        let oidc_token = token.fetch(&self.client).await?;
        let artifact_id = self.upload_artifact(artifact).await?;
        let handle = self
            .create_deployment(&artifact_id, build_version, &oidc_token)
            .await?;
        self.wait_for_deployment(&handle).await?;
        DeploymentResult::new(&handle.page_url, handle.id)
    }
}

/// Decode a JSON response, mapping HTTP failures to deployment errors.
async fn parse_json<T: serde::de::DeserializeOwned>(url: &str, response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        warn!(%url, %status, "hosting API returned an error");
        return Err(BookshipError::deployment_status(
            format!("{url}: HTTP {status}: {snippet}"),
            status.as_u16(),
        ));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| {
            BookshipError::deployment_rejected(format!("{url}: invalid response body: {e}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn options(endpoint: &str) -> DeployOptions {
        DeployOptions {
            endpoint: endpoint.to_string(),
            artifact_name: "github-pages".into(),
            api_token: Some("api-token".into()),
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(5),
            request_timeout_secs: 5,
        }
    }

    fn fake_artifact() -> PackagedArtifact {
        let path: PathBuf = std::env::temp_dir().join(format!(
            "bs-deploy-test-{}.tar.gz",
            uuid::Uuid::now_v7()
        ));
        std::fs::write(&path, b"fake archive bytes").unwrap();
        PackagedArtifact {
            path,
            sha256: "deadbeef".into(),
            size_bytes: 18,
            file_count: 1,
        }
    }

    async fn mount_upload_and_create(server: &wiremock::MockServer) {
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/artifacts"))
            .and(wiremock::matchers::query_param("name", "github-pages"))
            .and(wiremock::matchers::header("authorization", "Bearer api-token"))
            .and(wiremock::matchers::header("x-artifact-sha256", "deadbeef"))
            .respond_with(
                wiremock::ResponseTemplate::new(201).set_body_string(r#"{"id":"art-1"}"#),
            )
            .mount(server)
            .await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/deployments"))
            .and(wiremock::matchers::body_partial_json(serde_json::json!({
                "artifact_id": "art-1",
                "pages_build_version": "v1.2.3",
                "oidc_token": "id-token",
            })))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(
                r#"{"id":"dep-7","page_url":"https://owner.github.io/repo/"}"#,
            ))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn deploy_happy_path_returns_page_url() {
        let server = wiremock::MockServer::start().await;
        mount_upload_and_create(&server).await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/deployments/dep-7"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_string(r#"{"status":"deployment_in_progress"}"#),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/deployments/dep-7"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_string(r#"{"status":"succeed"}"#),
            )
            .mount(&server)
            .await;

        let client = PagesClient::new(options(&server.uri())).unwrap();
        let artifact = fake_artifact();
        let result = client
            .deploy(&artifact, "v1.2.3", &TokenSource::Static("id-token".into()))
            .await
            .unwrap();

        assert_eq!(result.public_url.as_str(), "https://owner.github.io/repo/");
        assert_eq!(result.deployment_id, "dep-7");

        let _ = std::fs::remove_file(&artifact.path);
    }

    #[tokio::test]
    async fn upload_error_is_deployment_error_with_status() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/artifacts"))
            .respond_with(wiremock::ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = PagesClient::new(options(&server.uri())).unwrap();
        let artifact = fake_artifact();
        let err = client.upload_artifact(&artifact).await.unwrap_err();

        match err {
            BookshipError::Deployment {
                status, message, ..
            } => {
                assert_eq!(status, Some(500));
                assert!(message.contains("boom"));
            }
            other => panic!("expected Deployment error, got {other:?}"),
        }

        let _ = std::fs::remove_file(&artifact.path);
    }

    #[tokio::test]
    async fn failed_deployment_status_is_error() {
        let server = wiremock::MockServer::start().await;
        mount_upload_and_create(&server).await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/deployments/dep-7"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_string(r#"{"status":"deployment_failed"}"#),
            )
            .mount(&server)
            .await;

        let client = PagesClient::new(options(&server.uri())).unwrap();
        let artifact = fake_artifact();
        let err = client
            .deploy(&artifact, "v1.2.3", &TokenSource::Static("id-token".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deployment_failed"));
        assert!(!err.is_retryable());

        let _ = std::fs::remove_file(&artifact.path);
    }

    #[tokio::test]
    async fn wait_gives_up_after_max_wait() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/deployments/slow"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_string(r#"{"status":"deployment_queued"}"#),
            )
            .mount(&server)
            .await;

        let mut opts = options(&server.uri());
        opts.max_wait = Duration::from_millis(50);
        let client = PagesClient::new(opts).unwrap();
        let handle = DeploymentHandle {
            id: "slow".into(),
            status_url: None,
            page_url: "https://example.com/".into(),
        };

        let err = client.wait_for_deployment(&handle).await.unwrap_err();
        assert!(err.to_string().contains("not live"));
    }
}
