//! Error types for the push engine
//!
//! Every failure of a run ends up as one [`PusherError`]. The variants follow the
//! stages of a push so the failing stage can be read off the error alone:
//! archive parsing, network transport, authentication, digest verification,
//! registry-side validation, and internal consistency checks.

pub mod handlers;

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PusherError>;

#[derive(Debug, Error)]
pub enum PusherError {
    /// The tar archive or its `manifest.json` index is malformed or incomplete
    #[error("Archive format error: {0}")]
    ArchiveFormat(String),

    /// Transient transport failure (connection, timeout, 5xx, 429)
    #[error("Network error: {message}")]
    Network {
        message: String,
        status: Option<u16>,
        retry_after: Option<Duration>,
    },

    /// Credential exchange failed or the registry kept rejecting fresh credentials
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Content digest differs between what was computed locally and what was confirmed
    #[error("Digest mismatch for {expected}: {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// The registry refused a blob operation
    #[error("Registry rejected {operation} (status {status}): {detail}")]
    RegistryRejected {
        operation: String,
        status: u16,
        detail: String,
    },

    /// The registry refused the manifest
    #[error("Manifest {reference} rejected (status {status}): {detail}")]
    ManifestRejected {
        reference: String,
        status: u16,
        detail: String,
    },

    /// A manifest was about to reference a blob that never reached the registry
    #[error("Incomplete image: {0}")]
    IncompleteImage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PusherError {
    pub fn network(message: impl Into<String>) -> Self {
        PusherError::Network {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Whether the retry policy may attempt the failed operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PusherError::Network { .. })
    }

    /// Server supplied backoff hint (`Retry-After` on 429/503)
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PusherError::Network { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Process exit status for this kind of failure
    pub fn exit_code(&self) -> i32 {
        match self {
            PusherError::Config(_) => 2,
            PusherError::ArchiveFormat(_) => 3,
            PusherError::Network { .. } => 4,
            PusherError::Authentication(_) => 5,
            PusherError::DigestMismatch { .. } => 6,
            PusherError::RegistryRejected { .. } | PusherError::ManifestRejected { .. } => 7,
            PusherError::IncompleteImage(_) => 70,
            PusherError::Io(_) => 74,
        }
    }
}

impl From<serde_json::Error> for PusherError {
    fn from(err: serde_json::Error) -> Self {
        PusherError::ArchiveFormat(format!("JSON error: {}", err))
    }
}

impl From<url::ParseError> for PusherError {
    fn from(err: url::ParseError) -> Self {
        PusherError::Config(format!("Invalid URL: {}", err))
    }
}

impl From<reqwest::Error> for PusherError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "request")
    }
}

impl From<regex::Error> for PusherError {
    fn from(err: regex::Error) -> Self {
        PusherError::Config(format!("Invalid tag pattern: {}", err))
    }
}
