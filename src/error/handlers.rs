//! Standardized mapping of HTTP responses and transport failures into [`PusherError`]

use crate::error::PusherError;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

/// Standard error handler for HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Classify a failed blob-side response. 5xx and 429 are transient, everything
    /// else is the registry refusing the operation.
    pub fn handle_registry_error(
        status: StatusCode,
        headers: &HeaderMap,
        error_text: &str,
        operation: &str,
    ) -> PusherError {
        if let Some(err) = Self::transient(status, headers, error_text, operation) {
            return err;
        }

        let detail = match status.as_u16() {
            401 => format!("unauthorized: {}", error_text),
            403 => format!("insufficient permissions: {}", error_text),
            404 => format!("repository not found or upload session expired: {}", error_text),
            413 => format!("blob too large: {}", error_text),
            416 => format!("chunk range not accepted: {}", error_text),
            _ => error_text.to_string(),
        };

        PusherError::RegistryRejected {
            operation: operation.to_string(),
            status: status.as_u16(),
            detail,
        }
    }

    /// Classify a failed upload completion. A rejected digest is never retried.
    pub fn handle_completion_error(
        status: StatusCode,
        headers: &HeaderMap,
        error_text: &str,
        digest: &str,
    ) -> PusherError {
        if status == StatusCode::BAD_REQUEST && error_text.contains("DIGEST_INVALID") {
            return PusherError::DigestMismatch {
                expected: digest.to_string(),
                actual: format!("registry rejected digest: {}", error_text),
            };
        }
        Self::handle_registry_error(status, headers, error_text, "upload completion")
    }

    /// Classify a failed manifest PUT
    pub fn handle_manifest_error(
        status: StatusCode,
        headers: &HeaderMap,
        error_text: &str,
        reference: &str,
    ) -> PusherError {
        if let Some(err) = Self::transient(status, headers, error_text, "manifest upload") {
            return err;
        }

        let detail = if error_text.contains("MANIFEST_BLOB_UNKNOWN") {
            format!("registry does not know a referenced blob: {}", error_text)
        } else if error_text.contains("MANIFEST_INVALID") || error_text.contains("UNSUPPORTED") {
            format!("manifest failed registry validation: {}", error_text)
        } else {
            error_text.to_string()
        };

        PusherError::ManifestRejected {
            reference: reference.to_string(),
            status: status.as_u16(),
            detail,
        }
    }

    /// Handle token endpoint failures
    pub fn handle_auth_error(status: StatusCode, error_text: &str) -> PusherError {
        let error_msg = match status.as_u16() {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!("Token request failed (status {}): {}", status, error_text),
        };

        PusherError::Authentication(error_msg)
    }

    fn transient(
        status: StatusCode,
        headers: &HeaderMap,
        error_text: &str,
        operation: &str,
    ) -> Option<PusherError> {
        let message = match status.as_u16() {
            429 => format!("Rate limited during {}: {}", operation, error_text),
            502 | 503 => format!("Registry unavailable during {}: {}", operation, error_text),
            504 => format!("Gateway timeout during {}: {}", operation, error_text),
            s if s >= 500 => format!(
                "Registry server error during {} (status {}): {}",
                operation, status, error_text
            ),
            _ => return None,
        };

        Some(PusherError::Network {
            message,
            status: Some(status.as_u16()),
            retry_after: Self::retry_after(headers),
        })
    }

    /// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
    pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize and format network errors with helpful context
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> PusherError {
        let message = if error.is_timeout() {
            format!("{} timeout: {}", context, error)
        } else if error.is_connect() {
            format!("Connection error during {}: {}", context, error)
        } else if error.to_string().contains("dns") {
            format!("DNS resolution error for {}: {}", context, error)
        } else if error.to_string().contains("certificate") {
            format!("TLS certificate error during {}: {}", context, error)
        } else {
            format!("{} network error: {}", context, error)
        };

        PusherError::Network {
            message,
            status: error.status().map(|s| s.as_u16()),
            retry_after: None,
        }
    }
}
