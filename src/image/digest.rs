//! SHA256 digest utilities
//!
//! Digests are always computed from content and rendered in the canonical
//! `sha256:<hex>` form used by the registry as the blob address.

use sha2::{Digest, Sha256};

pub const DIGEST_PREFIX: &str = "sha256:";

/// Digest of zero bytes
pub const EMPTY_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Incremental hasher fed while a blob streams past
#[derive(Clone, Default)]
pub struct BlobHasher {
    hasher: Sha256,
    bytes: u64,
}

impl BlobHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> String {
        format!("{}{}", DIGEST_PREFIX, hex::encode(self.hasher.finalize()))
    }
}

/// Utilities for working with SHA256 digests
pub struct DigestUtils;

impl DigestUtils {
    /// Digest of an in-memory buffer
    pub fn compute_digest(data: &[u8]) -> String {
        let mut hasher = BlobHasher::new();
        hasher.update(data);
        hasher.finish()
    }

    /// Validate SHA256 hex string (64 characters, all lowercase hex)
    pub fn is_valid_sha256_hex(hex_part: &str) -> bool {
        hex_part.len() == 64
            && hex_part
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    /// Validate full digest format (sha256:xxxxx)
    pub fn is_valid_digest(digest: &str) -> bool {
        digest
            .strip_prefix(DIGEST_PREFIX)
            .is_some_and(Self::is_valid_sha256_hex)
    }

    /// Format digest for display (truncated for readability)
    pub fn short(digest: &str) -> &str {
        if digest.len() > 19 { &digest[..19] } else { digest }
    }
}
