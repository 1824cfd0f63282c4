//! Docker image handles.
//!
//! Pull and build responses are progress streams. Each record is logged at
//! debug level; an error record in the stream fails the whole operation even
//! though the HTTP request itself succeeded.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::query_parameters::{
    BuildImageOptions, CreateImageOptions, ListImagesOptions, RemoveImageOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::backend::Image;
use crate::error::{Error, Result};
use crate::types::{BackendType, BuildInput};

/// Image operations against the Docker engine.
pub struct DockerImage {
    client: Docker,
    name: String,
}

impl DockerImage {
    pub(crate) fn new(client: Docker, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }

    fn map_error(&self, e: bollard::errors::Error) -> Error {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => Error::ImageNotFound(self.name.clone()),
            other => Error::Docker(other),
        }
    }
}

#[async_trait]
impl Image for DockerImage {
    async fn pull(&self) -> Result<()> {
        info!("Pulling {}", self.name);
        let opts = CreateImageOptions {
            from_image: Some(self.name.clone()),
            ..Default::default()
        };

        let pull_failed = |reason: String| Error::ImagePullFailed {
            reference: self.name.clone(),
            reason,
        };

        let mut stream = self.client.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| pull_failed(e.to_string()))?;
            if let Some(reason) = stream_error(
                progress.error,
                progress.error_detail.and_then(|d| d.message),
            ) {
                return Err(pull_failed(reason));
            }
            if let Some(status) = progress.status {
                debug!(
                    "{}: {} {}",
                    self.name,
                    status,
                    progress.progress.unwrap_or_default()
                );
            }
        }

        info!("Pulled {}", self.name);
        Ok(())
    }

    async fn build(&self, input: BuildInput) -> Result<()> {
        let input = match input {
            BuildInput::Docker(input) => input,
            other => {
                return Err(Error::UnsupportedBuildInput {
                    backend: BackendType::Docker,
                    input: other.backend_type(),
                })
            }
        };

        info!("Building {} from {}", self.name, input.dockerfile);
        let opts = BuildImageOptions {
            dockerfile: input.dockerfile.clone(),
            t: Some(self.name.clone()),
            rm: true,
            ..Default::default()
        };

        let build_failed = |reason: String| Error::ImageBuildFailed {
            reference: self.name.clone(),
            reason,
        };

        let mut stream =
            self.client
                .build_image(opts, None, Some(bollard::body_full(input.context)));
        while let Some(record) = stream.next().await {
            let record = record.map_err(|e| build_failed(e.to_string()))?;
            if let Some(reason) =
                stream_error(record.error, record.error_detail.and_then(|d| d.message))
            {
                return Err(build_failed(reason));
            }
            if let Some(line) = record.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!("{}: {}", self.name, line);
                }
            }
        }

        info!("Built {}", self.name);
        Ok(())
    }

    async fn exists(&self) -> bool {
        let opts = ListImagesOptions {
            filters: Some(HashMap::from([(
                "reference".to_string(),
                vec![self.name.clone()],
            )])),
            ..Default::default()
        };
        match self.client.list_images(Some(opts)).await {
            Ok(images) => !images.is_empty(),
            Err(e) => {
                debug!("Image lookup for {} failed: {}", self.name, e);
                false
            }
        }
    }

    async fn remove(&self) -> Result<()> {
        let opts = RemoveImageOptions {
            force: false,
            noprune: false,
            ..Default::default()
        };
        self.client
            .remove_image(&self.name, Some(opts), None)
            .await
            .map_err(|e| self.map_error(e))?;
        info!("Removed image {}", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn digest(&self) -> Result<String> {
        let image = self
            .client
            .inspect_image(&self.name)
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(pick_digest(
            image.repo_digests.as_deref().unwrap_or_default(),
            image.id.as_deref().unwrap_or_default(),
        ))
    }

    async fn tags(&self) -> Result<Vec<String>> {
        let image = self
            .client
            .inspect_image(&self.name)
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(image.repo_tags.unwrap_or_default())
    }
}

/// First non-empty of a record's `error` and `errorDetail.message`.
fn stream_error(error: Option<String>, detail: Option<String>) -> Option<String> {
    error
        .filter(|e| !e.is_empty())
        .or_else(|| detail.filter(|d| !d.is_empty()))
}

/// Digest from the first `repo@sha256:...` entry, else the image ID.
fn pick_digest(repo_digests: &[String], id: &str) -> String {
    let digest = repo_digests
        .first()
        .and_then(|entry| entry.split_once('@'))
        .map_or(id, |(_, digest)| digest);
    digest.strip_prefix("sha256:").unwrap_or(digest).to_string()
}
