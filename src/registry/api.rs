//! Registry operations used by the push pipeline
//!
//! [`RegistryApi`] is the seam between scheduling and transport: the HTTP
//! [`RegistryClient`](crate::registry::RegistryClient) implements it, the
//! [`RetryingRegistry`](crate::registry::RetryingRegistry) decorates it, and tests
//! substitute an in-memory registry.

use crate::error::Result;
use async_trait::async_trait;
use std::ops::Range;
use url::Url;

/// An open blob upload transaction on the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub repository: String,
    /// Where the next request for this upload goes
    pub location: Url,
    /// Bytes the registry has acknowledged so far
    pub bytes_sent: u64,
}

impl UploadSession {
    pub fn new(repository: &str, location: Url) -> Self {
        Self {
            repository: repository.to_string(),
            location,
            bytes_sent: 0,
        }
    }

    /// Range the next chunk of `len` bytes occupies
    pub fn next_range(&self, len: usize) -> Range<u64> {
        self.bytes_sent..self.bytes_sent + len as u64
    }
}

#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Check that the registry speaks the V2 API
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool>;

    async fn start_upload(&self, repository: &str) -> Result<UploadSession>;

    /// Send `data` as the bytes at `range` (end exclusive) of the blob.
    async fn push_chunk(
        &self,
        session: &UploadSession,
        range: Range<u64>,
        data: &[u8],
    ) -> Result<UploadSession>;

    /// Finish the upload under `digest`. Returns the digest the registry stored the
    /// blob under, which always equals `digest` on success.
    async fn complete_upload(&self, session: &UploadSession, digest: &str) -> Result<String>;

    /// Publish a manifest. Returns the `Docker-Content-Digest` reported, if any.
    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        manifest: &[u8],
    ) -> Result<Option<String>>;
}
