//! Parallel blob scheduling with concurrency control
//!
//! Every blob of an image is driven to a terminal state before
//! [`UploadScheduler::schedule`] returns. Existence probes run for all blobs at once;
//! uploads take a slot from a semaphore sized by the configured concurrency. The
//! first permanent failure raises an abort flag so that no further uploads start,
//! while uploads already running are left to finish or fail on their own.

use crate::error::{PusherError, Result};
use crate::image::archive::{BlobDescriptor, BlobKind, ImageArchive};
use crate::image::digest::DigestUtils;
use crate::image::manifest::{BlobStatus, ConfirmedBlob};
use crate::logging::Logger;
use crate::registry::api::RegistryApi;
use crate::upload::chunked::ChunkedUploader;
use crate::upload::progress::ProgressTracker;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;

/// Per-digest locks so one digest is never in two upload transactions at once,
/// even across separate `schedule` calls.
#[derive(Default)]
pub struct DigestLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DigestLocks {
    pub async fn lock(&self, digest: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|_| {
                PusherError::IncompleteImage("Digest lock table poisoned".to_string())
            })?;
            locks
                .entry(digest.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        Ok(lock.lock_owned().await)
    }
}

/// Result of scheduling the blobs of one image
#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub confirmed: HashMap<String, ConfirmedBlob>,
    pub uploaded: usize,
    pub existing: usize,
    pub bytes_uploaded: u64,
}

pub struct UploadScheduler {
    registry: Arc<dyn RegistryApi>,
    uploader: Arc<ChunkedUploader>,
    concurrency: usize,
    locks: Arc<DigestLocks>,
    output: Logger,
}

impl UploadScheduler {
    pub fn new(
        registry: Arc<dyn RegistryApi>,
        concurrency: usize,
        chunk_size: usize,
        output: Logger,
    ) -> Self {
        let uploader = Arc::new(ChunkedUploader::new(
            registry.clone(),
            chunk_size,
            output.clone(),
        ));
        Self {
            registry,
            uploader,
            concurrency: concurrency.max(1),
            locks: Arc::new(DigestLocks::default()),
            output,
        }
    }

    /// Drive `blobs` to a terminal state in `repository`.
    ///
    /// Returns the confirmations keyed by digest, or the first permanent failure once
    /// every started task has ended.
    pub async fn schedule(
        &self,
        archive: Arc<ImageArchive>,
        repository: &str,
        blobs: Vec<BlobDescriptor>,
    ) -> Result<ScheduleReport> {
        let mut seen = HashSet::new();
        let unique: Vec<BlobDescriptor> = blobs
            .into_iter()
            .filter(|blob| seen.insert(blob.digest.clone()))
            .collect();

        let total_size: u64 = unique.iter().map(|b| b.size).sum();
        self.output.info(&format!(
            "Pushing {} blobs ({}) to {} with {} concurrent uploads",
            unique.len(),
            self.output.format_size(total_size),
            repository,
            self.concurrency
        ));

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let abort = Arc::new(AtomicBool::new(false));
        let progress = ProgressTracker::new(total_size, self.output.clone(), "Uploading");

        let mut tasks = JoinSet::new();
        for blob in unique {
            let job = BlobJob {
                registry: self.registry.clone(),
                uploader: self.uploader.clone(),
                locks: self.locks.clone(),
                archive: archive.clone(),
                repository: repository.to_string(),
                semaphore: semaphore.clone(),
                abort: abort.clone(),
                progress: progress.clone(),
                output: self.output.clone(),
            };
            tasks.spawn(job.run(blob));
        }

        let mut report = ScheduleReport::default();
        let mut first_error: Option<PusherError> = None;

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(PusherError::IncompleteImage(format!("Upload task failed: {}", e)))
            });
            match outcome {
                Ok(Some(blob)) => {
                    match blob.status {
                        BlobStatus::Uploaded => {
                            report.uploaded += 1;
                            report.bytes_uploaded += blob.size;
                        }
                        BlobStatus::ExistsRemotely => report.existing += 1,
                        _ => {}
                    }
                    report.confirmed.insert(blob.digest.clone(), blob);
                }
                Ok(None) => {}
                Err(err) => {
                    abort.store(true, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(err);
                    } else {
                        self.output.debug(&format!("Further failure after abort: {}", err));
                    }
                }
            }
        }

        progress.finish();

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

struct BlobJob {
    registry: Arc<dyn RegistryApi>,
    uploader: Arc<ChunkedUploader>,
    locks: Arc<DigestLocks>,
    archive: Arc<ImageArchive>,
    repository: String,
    semaphore: Arc<Semaphore>,
    abort: Arc<AtomicBool>,
    progress: ProgressTracker,
    output: Logger,
}

impl BlobJob {
    /// `Ok(None)` means the blob was skipped because the run is aborting.
    async fn run(self, blob: BlobDescriptor) -> Result<Option<ConfirmedBlob>> {
        let result = self.drive(&blob).await;
        if let Err(err) = &result {
            self.abort.store(true, Ordering::SeqCst);
            self.output.error(&format!(
                "Blob {} failed: {}",
                DigestUtils::short(&blob.digest),
                err
            ));
        }
        result
    }

    async fn drive(&self, blob: &BlobDescriptor) -> Result<Option<ConfirmedBlob>> {
        if self.abort.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let _digest_guard = self.locks.lock(&blob.digest).await?;

        if self
            .registry
            .blob_exists(&self.repository, &blob.digest)
            .await?
        {
            self.output.detail(&format!(
                "Blob {} already exists, skipping",
                DigestUtils::short(&blob.digest)
            ));
            self.progress.update(blob.size);
            return Ok(Some(ConfirmedBlob {
                digest: blob.digest.clone(),
                size: blob.size,
                status: BlobStatus::ExistsRemotely,
            }));
        }

        let _permit = self.semaphore.acquire().await.map_err(|e| {
            PusherError::IncompleteImage(format!("Failed to acquire upload permit: {}", e))
        })?;
        if self.abort.load(Ordering::SeqCst) {
            return Ok(None);
        }

        self.output.step(&format!(
            "Uploading {} {} ({})",
            match blob.kind {
                BlobKind::Config => "config",
                BlobKind::Layer => "layer",
            },
            DigestUtils::short(&blob.digest),
            self.output.format_size(blob.size)
        ));

        let result = self
            .uploader
            .upload_blob(&self.archive, &self.repository, blob, &self.progress)
            .await;
        // Raised before the permit is released so waiting blobs see it
        if result.is_err() {
            self.abort.store(true, Ordering::SeqCst);
        }
        let confirmed = result?;

        self.output.success(&format!(
            "Blob {} pushed",
            DigestUtils::short(&blob.digest)
        ));
        Ok(Some(confirmed))
    }
}
