//! containerd image handles and rootfs resolution.
//!
//! Pulls go through the transfer service, which fetches and unpacks in one
//! call. Creating a container then needs the unpacked snapshot's name, the
//! chain ID of the image's layers, which is derived from the image config
//! found by walking the content store:
//!
//! ```text
//!   image.target ──► index? ──pick platform──► manifest ──► config
//!                                                           ├─ rootfs.diff_ids ──► chain ID
//!                                                           └─ config.Entrypoint/Cmd
//! ```

use async_trait::async_trait;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    DeleteImageRequest, GetImageRequest, ListImagesRequest, ReadContentRequest, TransferOptions,
    TransferRequest,
};
use containerd_client::to_any;
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::{Descriptor, Platform as OciPlatform};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::spec::ImageProcessDefaults;
use super::Client;
use crate::backend::Image;
use crate::constants::{
    DOCKER_MANIFEST_LIST_MEDIA_TYPE, MAX_CONTENT_BLOB_SIZE, OCI_IMAGE_INDEX_MEDIA_TYPE,
};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::types::{BackendType, BuildInput};

/// What `Create` needs from an unpacked image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Snapshot holding the unpacked layers.
    pub chain_id: String,
    pub process: ImageProcessDefaults,
}

/// Image operations against the containerd image store.
pub struct ContainerdImage {
    client: Client,
    name: String,
    platform: Platform,
}

impl ContainerdImage {
    pub(crate) fn new(client: Client, name: impl Into<String>, platform: Platform) -> Self {
        Self {
            client,
            name: name.into(),
            platform,
        }
    }

    fn oci_platform(&self) -> OciPlatform {
        OciPlatform {
            os: self.platform.os_str().to_string(),
            architecture: self.platform.arch_str().to_string(),
            ..Default::default()
        }
    }

    async fn target(&self) -> Result<Descriptor> {
        let mut images = ImagesClient::new(self.client.channel());
        let response = images
            .get(self.client.request(GetImageRequest {
                name: self.name.clone(),
            }))
            .await
            .map_err(|status| self.map_status(status))?;

        response
            .into_inner()
            .image
            .and_then(|image| image.target)
            .ok_or_else(|| Error::InvalidImage {
                reference: self.name.clone(),
                reason: "image record has no target descriptor".to_string(),
            })
    }

    fn map_status(&self, status: tonic::Status) -> Error {
        if status.code() == tonic::Code::NotFound {
            Error::ImageNotFound(self.name.clone())
        } else {
            Error::Grpc(status)
        }
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let mut content = ContentClient::new(self.client.channel());
        let mut stream = content
            .read(self.client.request(ReadContentRequest {
                digest: digest.to_string(),
                offset: 0,
                size: 0,
            }))
            .await?
            .into_inner();

        let mut blob = Vec::new();
        while let Some(chunk) = stream.message().await? {
            blob.extend_from_slice(&chunk.data);
            if blob.len() > MAX_CONTENT_BLOB_SIZE {
                return Err(Error::InvalidImage {
                    reference: self.name.clone(),
                    reason: format!("blob {digest} exceeds {MAX_CONTENT_BLOB_SIZE} bytes"),
                });
            }
        }
        Ok(blob)
    }

    /// Walks index, manifest and config to find the rootfs snapshot and the
    /// image's default argv.
    pub async fn resolve(&self) -> Result<ResolvedImage> {
        let target = self.target().await?;
        let mut blob = self.read_blob(&target.digest).await?;

        if is_index(&target.media_type, &blob) {
            let index: ImageIndex = serde_json::from_slice(&blob)?;
            let manifest = index
                .select(self.platform.os_str(), self.platform.arch_str())
                .ok_or_else(|| Error::InvalidImage {
                    reference: self.name.clone(),
                    reason: format!("no manifest for {}", self.platform.oci_platform()),
                })?;
            debug!("Selected manifest {} for {}", manifest.digest, self.name);
            blob = self.read_blob(&manifest.digest).await?;
        }

        let manifest: ImageManifest = serde_json::from_slice(&blob)?;
        let config: ImageConfig =
            serde_json::from_slice(&self.read_blob(&manifest.config.digest).await?)?;

        let chain_id =
            chain_id(&config.rootfs.diff_ids).ok_or_else(|| Error::InvalidImage {
                reference: self.name.clone(),
                reason: "image has no layers".to_string(),
            })?;

        Ok(ResolvedImage {
            chain_id,
            process: config.config,
        })
    }
}

#[async_trait]
impl Image for ContainerdImage {
    async fn pull(&self) -> Result<()> {
        info!("Pulling {} for {}", self.name, self.platform.oci_platform());
        let platform = self.oci_platform();

        let source = OciRegistry {
            reference: self.name.clone(),
            resolver: Default::default(),
        };
        let destination = ImageStore {
            name: self.name.clone(),
            platforms: vec![platform.clone()],
            unpacks: vec![UnpackConfiguration {
                platform: Some(platform),
                ..Default::default()
            }],
            ..Default::default()
        };
        let request = TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: Some(TransferOptions::default()),
        };

        let mut transfer = TransferClient::new(self.client.channel());
        transfer
            .transfer(self.client.request(request))
            .await
            .map_err(|status| Error::ImagePullFailed {
                reference: self.name.clone(),
                reason: status.message().to_string(),
            })?;

        info!("Pulled {}", self.name);
        Ok(())
    }

    async fn build(&self, input: BuildInput) -> Result<()> {
        match input {
            BuildInput::Containerd(_) => Err(Error::BuildNotSupported {
                backend: BackendType::Containerd,
            }),
            other => Err(Error::UnsupportedBuildInput {
                backend: BackendType::Containerd,
                input: other.backend_type(),
            }),
        }
    }

    async fn exists(&self) -> bool {
        match self.target().await {
            Ok(_) => true,
            Err(e) => {
                if !e.is_not_found() {
                    debug!("Image lookup for {} failed: {}", self.name, e);
                }
                false
            }
        }
    }

    async fn remove(&self) -> Result<()> {
        let mut images = ImagesClient::new(self.client.channel());
        images
            .delete(self.client.request(DeleteImageRequest {
                name: self.name.clone(),
                sync: true,
                ..Default::default()
            }))
            .await
            .map_err(|status| self.map_status(status))?;
        info!("Removed image {}", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn digest(&self) -> Result<String> {
        let target = self.target().await?;
        Ok(strip_sha256(&target.digest).to_string())
    }

    async fn tags(&self) -> Result<Vec<String>> {
        let target = self.target().await?;
        let mut images = ImagesClient::new(self.client.channel());
        let response = images
            .list(self.client.request(ListImagesRequest {
                filters: vec![format!("target.digest=={}", target.digest)],
            }))
            .await?;

        Ok(response
            .into_inner()
            .images
            .into_iter()
            .map(|image| image.name)
            .collect())
    }
}

// =============================================================================
// Content Documents
// =============================================================================

#[derive(Debug, Deserialize)]
struct ImageIndex {
    manifests: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    #[serde(default)]
    platform: Option<IndexPlatform>,
}

#[derive(Debug, Deserialize)]
struct IndexPlatform {
    os: String,
    architecture: String,
}

impl ImageIndex {
    /// First manifest matching os/arch; a single untagged manifest also matches.
    fn select(&self, os: &str, arch: &str) -> Option<&IndexEntry> {
        self.manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == os && p.architecture == arch)
            })
            .or_else(|| match self.manifests.as_slice() {
                [only] if only.platform.is_none() => Some(only),
                _ => None,
            })
    }
}

#[derive(Debug, Deserialize)]
struct ImageManifest {
    config: ManifestConfig,
}

#[derive(Debug, Deserialize)]
struct ManifestConfig {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: ImageProcessDefaults,
    rootfs: RootFs,
}

#[derive(Debug, Deserialize)]
struct RootFs {
    diff_ids: Vec<String>,
}

fn is_index(media_type: &str, blob: &[u8]) -> bool {
    if media_type == OCI_IMAGE_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE {
        return true;
    }
    // Some registries omit the media type; an index is the only document
    // with a top-level `manifests` array.
    serde_json::from_slice::<serde_json::Value>(blob)
        .map(|doc| doc.get("manifests").is_some_and(serde_json::Value::is_array))
        .unwrap_or(false)
}

/// Computes the OCI chain ID of a layer stack.
///
/// `chain[0] = diff[0]`, `chain[n] = sha256(chain[n-1] + " " + diff[n])`.
#[must_use]
pub fn chain_id(diff_ids: &[String]) -> Option<String> {
    let (first, rest) = diff_ids.split_first()?;
    Some(rest.iter().fold(first.clone(), |parent, diff| {
        let digest = Sha256::digest(format!("{parent} {diff}").as_bytes());
        format!("sha256:{}", hex::encode(digest))
    }))
}

fn strip_sha256(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}
