//! Retry with exponential backoff for registry operations
//!
//! Only transient failures ([`PusherError::is_retryable`]) are retried. Anything else
//! is returned from the first attempt that produced it.

use crate::config::RetryConfig;
use crate::error::Result;
use crate::logging::Logger;
use crate::registry::api::{RegistryApi, UploadSession};
use async_trait::async_trait;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`. A server hint
    /// (`Retry-After`) replaces the computed delay, under the same cap.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = match hint {
            Some(hint) => hint,
            None => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently or the attempt budget
    /// is spent.
    pub async fn run<T, F, Fut>(&self, description: &str, output: &Logger, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, err.retry_after());
                    output.warning(&format!(
                        "{} failed (attempt {}/{}): {}; retrying in {}",
                        description,
                        attempt,
                        self.max_attempts,
                        err,
                        output.format_duration(delay)
                    ));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        output.debug(&format!(
                            "{} giving up after {} attempts",
                            description, attempt
                        ));
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// [`RegistryApi`] decorator applying a [`RetryPolicy`] to every operation
pub struct RetryingRegistry {
    inner: Arc<dyn RegistryApi>,
    policy: RetryPolicy,
    output: Logger,
}

impl RetryingRegistry {
    pub fn new(inner: Arc<dyn RegistryApi>, policy: RetryPolicy, output: Logger) -> Self {
        Self {
            inner,
            policy,
            output,
        }
    }
}

#[async_trait]
impl RegistryApi for RetryingRegistry {
    async fn ping(&self) -> Result<()> {
        self.policy
            .run("Registry check", &self.output, move || self.inner.ping())
            .await
    }

    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        self.policy
            .run("Blob check", &self.output, move || {
                self.inner.blob_exists(repository, digest)
            })
            .await
    }

    async fn start_upload(&self, repository: &str) -> Result<UploadSession> {
        self.policy
            .run("Upload start", &self.output, move || {
                self.inner.start_upload(repository)
            })
            .await
    }

    async fn push_chunk(
        &self,
        session: &UploadSession,
        range: Range<u64>,
        data: &[u8],
    ) -> Result<UploadSession> {
        let description = format!("Chunk {}-{}", range.start, range.end);
        self.policy
            .run(&description, &self.output, move || {
                self.inner.push_chunk(session, range.clone(), data)
            })
            .await
    }

    async fn complete_upload(&self, session: &UploadSession, digest: &str) -> Result<String> {
        self.policy
            .run("Upload completion", &self.output, move || {
                self.inner.complete_upload(session, digest)
            })
            .await
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        manifest: &[u8],
    ) -> Result<Option<String>> {
        self.policy
            .run("Manifest upload", &self.output, move || {
                self.inner
                    .put_manifest(repository, reference, media_type, manifest)
            })
            .await
    }
}
