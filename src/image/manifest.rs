//! Image manifest assembly
//!
//! Builds a Docker Image Manifest V2 Schema 2 document from blobs the registry has
//! confirmed. Values come from the confirmation (digest computed from content, size
//! actually transferred), never from what the archive declares.

use crate::error::{PusherError, Result};
use crate::image::archive::ImageBlobs;
use crate::image::digest::DigestUtils;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const OCI_LAYER_ZSTD_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Terminal state of one blob, as confirmed against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStatus {
    Pending,
    ExistsRemotely,
    Uploading,
    Uploaded,
    Failed,
}

impl BlobStatus {
    pub fn is_present(self) -> bool {
        matches!(self, BlobStatus::ExistsRemotely | BlobStatus::Uploaded)
    }
}

/// What the registry holds for a digest after scheduling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedBlob {
    pub digest: String,
    pub size: u64,
    pub status: BlobStatus,
}

impl Manifest {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Digest of the serialized manifest, i.e. its content address on the registry
    pub fn digest(&self) -> Result<String> {
        Ok(DigestUtils::compute_digest(&self.to_json()?))
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 2 {
            return Err(PusherError::IncompleteImage(format!(
                "Unsupported schema version {}",
                self.schema_version
            )));
        }
        for descriptor in std::iter::once(&self.config).chain(self.layers.iter()) {
            if !DigestUtils::is_valid_digest(&descriptor.digest) {
                return Err(PusherError::IncompleteImage(format!(
                    "Manifest references malformed digest {}",
                    descriptor.digest
                )));
            }
        }
        Ok(())
    }
}

pub struct ManifestAssembler;

impl ManifestAssembler {
    /// Build the manifest for `image` from the scheduler's confirmations, keyed by digest.
    ///
    /// Every referenced digest must be confirmed present; anything else means the
    /// scheduler let the run get here without finishing, which is a defect.
    pub fn assemble(
        image: &ImageBlobs,
        confirmed: &HashMap<String, ConfirmedBlob>,
    ) -> Result<Manifest> {
        let describe = |digest: &str, media_type: &str| -> Result<Descriptor> {
            let blob = confirmed
                .get(digest)
                .filter(|blob| blob.status.is_present())
                .ok_or_else(|| {
                    PusherError::IncompleteImage(format!(
                        "Blob {} was never confirmed on the registry",
                        digest
                    ))
                })?;
            Ok(Descriptor {
                media_type: media_type.to_string(),
                size: blob.size,
                digest: blob.digest.clone(),
            })
        };

        let config = describe(&image.config.digest, &image.config.media_type)?;
        let layers = image
            .layers
            .iter()
            .map(|layer| describe(&layer.digest, &layer.media_type))
            .collect::<Result<Vec<_>>>()?;

        let manifest = Manifest {
            schema_version: 2,
            media_type: DOCKER_MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers,
        };
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::archive::{BlobDescriptor, BlobKind};

    fn blob(kind: BlobKind, content: &[u8], media_type: &str) -> BlobDescriptor {
        BlobDescriptor {
            kind,
            path: "x".to_string(),
            digest: DigestUtils::compute_digest(content),
            size: content.len() as u64,
            media_type: media_type.to_string(),
        }
    }

    fn image() -> ImageBlobs {
        ImageBlobs {
            repo_tags: vec!["app:1.0".to_string()],
            config: blob(BlobKind::Config, b"{}", DOCKER_CONFIG_MEDIA_TYPE),
            layers: vec![
                blob(BlobKind::Layer, b"layer-one", DOCKER_LAYER_MEDIA_TYPE),
                blob(BlobKind::Layer, b"layer-two", DOCKER_LAYER_GZIP_MEDIA_TYPE),
            ],
        }
    }

    fn confirm(image: &ImageBlobs, status: BlobStatus) -> HashMap<String, ConfirmedBlob> {
        image
            .all()
            .map(|b| {
                (
                    b.digest.clone(),
                    ConfirmedBlob {
                        digest: b.digest.clone(),
                        size: b.size,
                        status,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn assembles_layers_in_archive_order() {
        let image = image();
        let manifest =
            ManifestAssembler::assemble(&image, &confirm(&image, BlobStatus::Uploaded)).unwrap();

        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.media_type, DOCKER_MANIFEST_MEDIA_TYPE);
        assert_eq!(manifest.config.digest, image.config.digest);
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0].digest, image.layers[0].digest);
        assert_eq!(manifest.layers[1].media_type, DOCKER_LAYER_GZIP_MEDIA_TYPE);
    }

    #[test]
    fn uses_confirmed_size_not_archive_size() {
        let image = image();
        let mut confirmed = confirm(&image, BlobStatus::ExistsRemotely);
        confirmed.get_mut(&image.layers[0].digest).unwrap().size = 999;
        let manifest = ManifestAssembler::assemble(&image, &confirmed).unwrap();
        assert_eq!(manifest.layers[0].size, 999);
    }

    #[test]
    fn unconfirmed_blob_is_incomplete_image() {
        let image = image();
        let mut confirmed = confirm(&image, BlobStatus::Uploaded);
        confirmed.get_mut(&image.layers[1].digest).unwrap().status = BlobStatus::Failed;
        assert!(matches!(
            ManifestAssembler::assemble(&image, &confirmed),
            Err(PusherError::IncompleteImage(_))
        ));

        confirmed.remove(&image.config.digest);
        assert!(matches!(
            ManifestAssembler::assemble(&image, &confirmed),
            Err(PusherError::IncompleteImage(_))
        ));
    }

    #[test]
    fn serializes_with_registry_field_names() {
        let image = image();
        let manifest =
            ManifestAssembler::assemble(&image, &confirm(&image, BlobStatus::Uploaded)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(value["config"]["mediaType"], DOCKER_CONFIG_MEDIA_TYPE);
        assert_eq!(value["layers"][0]["size"], 9);
        assert_eq!(manifest.digest().unwrap(), manifest.digest().unwrap());
    }
}
