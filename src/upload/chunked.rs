//! Chunked upload of a single blob
//!
//! One upload transaction per call: start a session, stream the archive member
//! through it in fixed-size chunks, then commit under the blob's digest. The bytes
//! are hashed again while they stream, and the commit only happens if they still
//! hash to the digest recorded when the archive was indexed.

use crate::error::{PusherError, Result};
use crate::image::archive::{BlobDescriptor, ImageArchive};
use crate::image::digest::{BlobHasher, DigestUtils};
use crate::image::manifest::{BlobStatus, ConfirmedBlob};
use crate::logging::Logger;
use crate::registry::api::RegistryApi;
use crate::upload::progress::ProgressTracker;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

pub struct ChunkedUploader {
    registry: Arc<dyn RegistryApi>,
    chunk_size: usize,
    output: Logger,
}

impl ChunkedUploader {
    pub fn new(registry: Arc<dyn RegistryApi>, chunk_size: usize, output: Logger) -> Self {
        Self {
            registry,
            chunk_size: chunk_size.max(1),
            output,
        }
    }

    pub async fn upload_blob(
        &self,
        archive: &ImageArchive,
        repository: &str,
        blob: &BlobDescriptor,
        progress: &ProgressTracker,
    ) -> Result<ConfirmedBlob> {
        let entry = archive.entry(&blob.path)?;
        let mut session = self.registry.start_upload(repository).await?;

        self.output.detail(&format!(
            "Uploading {} ({}) in chunks of {}",
            DigestUtils::short(&blob.digest),
            self.output.format_size(blob.size),
            self.output.format_size(self.chunk_size as u64)
        ));

        let mut reader = archive.open_blob(entry).await?;
        let mut hasher = BlobHasher::new();
        let mut buffer = vec![0u8; self.chunk_size.min(blob.size.max(1) as usize)];

        loop {
            let n = fill_buffer(&mut reader, &mut buffer).await?;
            if n == 0 {
                break;
            }
            let chunk = &buffer[..n];
            hasher.update(chunk);

            let range = session.next_range(n);
            session = self.registry.push_chunk(&session, range, chunk).await?;
            progress.update(n as u64);
        }

        let local_size = hasher.bytes();
        let local_digest = hasher.finish();
        if local_digest != blob.digest {
            return Err(PusherError::DigestMismatch {
                expected: blob.digest.clone(),
                actual: format!("archive member {} now hashes to {}", blob.path, local_digest),
            });
        }
        if local_size != blob.size || session.bytes_sent != blob.size {
            return Err(PusherError::ArchiveFormat(format!(
                "Blob {} changed size: indexed {} bytes, streamed {}, registry acknowledged {}",
                blob.digest, blob.size, local_size, session.bytes_sent
            )));
        }

        let digest = self
            .registry
            .complete_upload(&session, &blob.digest)
            .await?;

        Ok(ConfirmedBlob {
            digest,
            size: session.bytes_sent,
            status: BlobStatus::Uploaded,
        })
    }
}

/// Read until `buffer` is full or the stream ends
async fn fill_buffer<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
