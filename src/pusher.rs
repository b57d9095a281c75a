//! Push orchestration
//!
//! One run of [`ImagePusher::run`] indexes the archive, resolves every image's repo
//! tags into targets, pushes the blobs of each image once per target repository and
//! publishes one manifest per target. A manifest PUT is only issued after the
//! scheduler has returned, i.e. after every blob of the image reached a terminal
//! state, and only when none of them failed.

use crate::config::{PushConfig, Reference, Target};
use crate::error::{PusherError, Result};
use crate::image::archive::{ImageArchive, ImageBlobs};
use crate::image::manifest::{DOCKER_MANIFEST_MEDIA_TYPE, ManifestAssembler};
use crate::logging::Logger;
use crate::registry::{RegistryApi, RegistryClient, RetryPolicy, RetryingRegistry};
use crate::upload::UploadScheduler;
use std::sync::Arc;

/// A manifest published by the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedManifest {
    pub target: Target,
    pub digest: String,
}

#[derive(Debug, Default)]
pub struct PushSummary {
    pub images: usize,
    pub manifests: Vec<PublishedManifest>,
    pub blobs_uploaded: usize,
    pub blobs_existing: usize,
    pub bytes_uploaded: u64,
}

pub struct ImagePusher {
    config: PushConfig,
    registry: Arc<dyn RegistryApi>,
    scheduler: UploadScheduler,
    output: Logger,
}

impl ImagePusher {
    /// Pusher talking HTTP to the configured registry, with retries
    pub fn new(config: PushConfig, output: Logger) -> Result<Self> {
        let client = RegistryClient::builder(config.registry.clone())
            .with_auth(config.auth.clone())
            .with_logger(output.clone())
            .build()?;
        Ok(Self::with_registry(config, Arc::new(client), output))
    }

    /// Pusher over any registry implementation; the retry policy is applied on top.
    pub fn with_registry(config: PushConfig, inner: Arc<dyn RegistryApi>, output: Logger) -> Self {
        let registry: Arc<dyn RegistryApi> = Arc::new(RetryingRegistry::new(
            inner,
            RetryPolicy::from(&config.retry),
            output.clone(),
        ));
        let scheduler = UploadScheduler::new(
            registry.clone(),
            config.upload.concurrency,
            config.upload.chunk_size,
            output.clone(),
        );
        Self {
            config,
            registry,
            scheduler,
            output,
        }
    }

    pub async fn run(&self) -> Result<PushSummary> {
        self.config.validate()?;

        self.output.section("Reading archive");
        let archive = self.open_archive().await?;

        self.output.step(&format!(
            "Checking registry {}",
            self.config.registry.url
        ));
        self.registry.ping().await?;

        let mut summary = PushSummary::default();
        for index in 0..archive.images().len() {
            let image = archive.image_blobs(index)?;
            let targets = self.resolve_targets(&image)?;
            self.describe_image(&archive, index, &image, &targets);

            for (repository, references) in group_by_repository(&targets) {
                self.push_to_repository(&archive, &image, &repository, &references, &mut summary)
                    .await?;
            }
            summary.images += 1;
        }

        self.output.summary_kv(
            "Push summary",
            &[
                ("Images", summary.images.to_string()),
                ("Manifests", summary.manifests.len().to_string()),
                ("Blobs uploaded", summary.blobs_uploaded.to_string()),
                ("Blobs already present", summary.blobs_existing.to_string()),
                ("Uploaded", self.output.format_size(summary.bytes_uploaded)),
                ("Elapsed", self.output.elapsed()),
            ],
        );
        Ok(summary)
    }

    async fn open_archive(&self) -> Result<Arc<ImageArchive>> {
        let path = self.config.archive_path.clone();
        let output = self.output.clone();
        let archive = tokio::task::spawn_blocking(move || ImageArchive::open(&path, &output))
            .await
            .map_err(|e| PusherError::ArchiveFormat(format!("Archive indexing task failed: {}", e)))??;
        Ok(Arc::new(archive))
    }

    fn resolve_targets(&self, image: &ImageBlobs) -> Result<Vec<Target>> {
        let overrides = &self.config.overrides;
        let mut targets: Vec<Target> = Vec::new();

        if image.repo_tags.is_empty() {
            targets.push(overrides.resolve(None)?);
        } else {
            for repo_tag in &image.repo_tags {
                let target = overrides.resolve(Some(repo_tag))?;
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        Ok(targets)
    }

    fn describe_image(&self, archive: &ImageArchive, index: usize, image: &ImageBlobs, targets: &[Target]) {
        self.output.section(&format!("Image {} of {}", index + 1, archive.images().len()));
        let summary = archive.config_summary(&image.config.path);
        self.output.info(&format!(
            "{} layers, {} total{}",
            image.layers.len(),
            self.output.format_size(image.total_size()),
            match (summary.os, summary.architecture) {
                (Some(os), Some(arch)) => format!(", {}/{}", os, arch),
                _ => String::new(),
            }
        ));
        for target in targets {
            self.output.info(&format!("Target: {}/{}", self.config.registry.host(), target));
        }
    }

    async fn push_to_repository(
        &self,
        archive: &Arc<ImageArchive>,
        image: &ImageBlobs,
        repository: &str,
        references: &[Reference],
        summary: &mut PushSummary,
    ) -> Result<()> {
        self.output.subsection(&format!("Pushing blobs to {}", repository));
        let report = self
            .scheduler
            .schedule(archive.clone(), repository, image.all().cloned().collect())
            .await?;
        summary.blobs_uploaded += report.uploaded;
        summary.blobs_existing += report.existing;
        summary.bytes_uploaded += report.bytes_uploaded;

        let manifest = ManifestAssembler::assemble(image, &report.confirmed)?;
        let body = manifest.to_json()?;
        let digest = manifest.digest()?;

        for reference in references {
            let target = Target {
                repository: repository.to_string(),
                reference: reference.clone(),
            };

            if let Reference::Digest(expected) = reference {
                if *expected != digest {
                    return Err(PusherError::DigestMismatch {
                        expected: expected.clone(),
                        actual: format!("assembled manifest for {} has digest {}", repository, digest),
                    });
                }
            }

            self.output.step(&format!("Publishing manifest {}", target));
            let reported = self
                .registry
                .put_manifest(repository, reference.as_str(), DOCKER_MANIFEST_MEDIA_TYPE, &body)
                .await?;

            if let Some(reported) = reported {
                if reported != digest {
                    return Err(PusherError::DigestMismatch {
                        expected: digest,
                        actual: format!("registry stored manifest {} as {}", target, reported),
                    });
                }
            }

            self.output.success(&format!("Published {} ({})", target, digest));
            summary.manifests.push(PublishedManifest {
                target,
                digest: digest.clone(),
            });
        }
        Ok(())
    }
}

/// Group targets by repository, keeping first-seen order.
fn group_by_repository(targets: &[Target]) -> Vec<(String, Vec<Reference>)> {
    let mut groups: Vec<(String, Vec<Reference>)> = Vec::new();
    for target in targets {
        match groups.iter_mut().find(|(repo, _)| *repo == target.repository) {
            Some((_, references)) => references.push(target.reference.clone()),
            None => groups.push((target.repository.clone(), vec![target.reference.clone()])),
        }
    }
    groups
}
