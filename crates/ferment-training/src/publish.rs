use crate::artifacts::ExportArtifact;
use crate::config::ExportConfig;
use crate::error::{PublishError, PublishResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedArtifact {
    /// Remote location of the artifact directory.
    pub location: String,
    pub files: usize,
}

/// Pushes an exported artifact to a remote model repository.
///
/// Publishing never modifies the local artifact, whatever the outcome.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, artifact: &ExportArtifact, destination: &str) -> PublishResult<PublishedArtifact>;
}

/// Uploads each artifact file with a `PUT` to
/// `<endpoint>/<destination>/<method>/<file>` using bearer auth.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpPublisher {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into().trim_end_matches('/').to_string(), token }
    }

    /// Endpoint from the export section, token from the configured environment variable.
    pub fn from_config(config: &ExportConfig) -> Self {
        let token = std::env::var(&config.remote_token_env).ok().filter(|t| !t.trim().is_empty());
        Self::new(config.remote_endpoint.clone().unwrap_or_default(), token)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, artifact: &ExportArtifact, destination: &str) -> PublishResult<PublishedArtifact> {
        let location = format!("{}/{}/{}", self.endpoint, destination.trim_matches('/'), artifact.method);
        let Some(token) = &self.token else {
            return Err(PublishError::Auth { destination: location, message: "no access token configured".to_string() });
        };

        for file in &artifact.files {
            let body = tokio::fs::read(artifact.dir.join(&file.path)).await?;
            let url = format!("{location}/{}", file.path);

            let response = self
                .client
                .put(&url)
                .bearer_auth(token)
                .header("x-content-sha256", &file.sha256)
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, url = %url, "failed to upload artifact file");
                    PublishError::Network { destination: location.clone(), message: e.to_string() }
                })?;

            let status = response.status();
            if status == 401 || status == 403 {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                return Err(PublishError::Auth { destination: location, message });
            }
            if !status.is_success() {
                return Err(PublishError::Rejected { file: file.path.clone(), status: status.as_u16() });
            }
            tracing::debug!(file = %file.path, bytes = file.bytes, "uploaded");
        }

        tracing::info!(method = %artifact.method, location = %location, files = artifact.files.len(), "artifact published");
        Ok(PublishedArtifact { location, files: artifact.files.len() })
    }
}
