//! HTTP implementation of [`RegistryApi`] against the Registry HTTP API V2

use crate::config::{AuthConfig, RegistryConfig};
use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{PusherError, Result};
use crate::image::digest::DigestUtils;
use crate::logging::Logger;
use crate::registry::api::{RegistryApi, UploadSession};
use crate::registry::auth::{Auth, Challenge, Credential};
use crate::registry::token_manager::{TokenManager, push_scope};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, LOCATION, RANGE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::ops::Range;
use url::Url;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const OCTET_STREAM: &str = "application/octet-stream";

pub struct RegistryClientBuilder {
    registry: RegistryConfig,
    auth_config: AuthConfig,
    output: Logger,
}

impl RegistryClientBuilder {
    pub fn new(registry: RegistryConfig) -> Self {
        Self {
            registry,
            auth_config: AuthConfig::default(),
            output: Logger::default(),
        }
    }

    pub fn with_auth(mut self, auth_config: AuthConfig) -> Self {
        self.auth_config = auth_config;
        self
    }

    pub fn with_logger(mut self, output: Logger) -> Self {
        self.output = output;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let mut builder = Client::builder().timeout(self.registry.timeout);
        if self.registry.skip_tls {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let client = builder
            .build()
            .map_err(|e| PusherError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let auth = Auth::new(client.clone(), self.auth_config, self.output.clone());
        let tokens = TokenManager::new(auth, self.output.clone());

        Ok(RegistryClient {
            client,
            base: self.registry.url,
            tokens,
            output: self.output,
        })
    }
}

pub struct RegistryClient {
    client: Client,
    base: Url,
    tokens: TokenManager,
    output: Logger,
}

impl RegistryClient {
    pub fn builder(registry: RegistryConfig) -> RegistryClientBuilder {
        RegistryClientBuilder::new(registry)
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.tokens
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    /// Resolve a `Location` header, which may be absolute or relative to the registry.
    fn resolve_location(&self, headers: &HeaderMap, operation: &str) -> Result<Url> {
        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PusherError::RegistryRejected {
                operation: operation.to_string(),
                status: 0,
                detail: "response carried no Location header".to_string(),
            })?;
        self.base.join(location).map_err(|e| PusherError::RegistryRejected {
            operation: operation.to_string(),
            status: 0,
            detail: format!("unusable Location {}: {}", location, e),
        })
    }

    /// Send a request for `url` built by `build`, answering at most one auth challenge.
    ///
    /// Credentials only go to the registry's own origin; an upload `Location` on
    /// another host gets the request without them. A 401 for a credential obtained
    /// during this same call is final.
    async fn send(
        &self,
        scope: &str,
        operation: &str,
        url: &Url,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        let trusted = self.is_registry_origin(url);
        let mut credential = if trusted {
            self.tokens.cached(scope)?
        } else {
            self.output.debug(&format!(
                "Sending {} to {} without registry credentials",
                operation,
                url.origin().ascii_serialization()
            ));
            None
        };
        let mut challenged = false;

        loop {
            let mut request = build();
            if let Some(credential) = &credential {
                request = credential.apply(request);
            }

            let response = request
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if !trusted {
                return Err(PusherError::Authentication(format!(
                    "{} answered {} with 401; registry credentials are not sent to other hosts",
                    url.origin().ascii_serialization(),
                    operation
                )));
            }
            if challenged {
                return Err(PusherError::Authentication(format!(
                    "Registry rejected fresh credentials during {}",
                    operation
                )));
            }

            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(Challenge::parse)
                .ok_or_else(|| {
                    PusherError::Authentication(format!(
                        "Unauthorized during {} without a usable challenge",
                        operation
                    ))
                })?;

            self.output
                .debug(&format!("Auth challenge during {}: {:?}", operation, challenge));
            let fresh: Credential = self
                .tokens
                .refresh(scope, &challenge, credential.as_ref())
                .await?;
            credential = Some(fresh);
            challenged = true;
        }
    }

    fn is_registry_origin(&self, url: &Url) -> bool {
        url.origin() == self.base.origin()
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        self.client.request(method, url.clone())
    }
}

async fn error_text(response: Response) -> (StatusCode, HeaderMap, String) {
    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await.unwrap_or_default();
    (status, headers, text)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse the `Range: 0-<last>` header of an upload response into bytes received.
fn received_bytes(headers: &HeaderMap) -> Option<u64> {
    let range = headers.get(RANGE)?.to_str().ok()?;
    let (_, last) = range.trim().split_once('-')?;
    last.trim().parse::<u64>().ok().map(|last| last + 1)
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn ping(&self) -> Result<()> {
        let url = self.endpoint("v2/")?;
        let response = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "registry check"))?;

        match response.status().as_u16() {
            200 => {
                self.output.detail("Registry API v2 is available");
                Ok(())
            }
            401 => {
                self.output.detail("Registry requires authentication");
                Ok(())
            }
            _ => {
                let (status, headers, text) = error_text(response).await;
                Err(HttpErrorHandler::handle_registry_error(
                    status,
                    &headers,
                    &text,
                    "registry check",
                ))
            }
        }
    }

    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let url = self.endpoint(&format!("v2/{}/blobs/{}", repository, digest))?;
        let scope = push_scope(repository);
        let response = self
            .send(&scope, "blob check", &url, || self.request(Method::HEAD, &url))
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => {
                let (status, headers, text) = error_text(response).await;
                Err(HttpErrorHandler::handle_registry_error(
                    status,
                    &headers,
                    &text,
                    "blob check",
                ))
            }
        }
    }

    async fn start_upload(&self, repository: &str) -> Result<UploadSession> {
        let url = self.endpoint(&format!("v2/{}/blobs/uploads/", repository))?;
        let scope = push_scope(repository);
        let response = self
            .send(&scope, "upload start", &url, || {
                self.request(Method::POST, &url).header(CONTENT_LENGTH, "0")
            })
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            let (status, headers, text) = error_text(response).await;
            return Err(HttpErrorHandler::handle_registry_error(
                status,
                &headers,
                &text,
                "upload start",
            ));
        }

        let location = self.resolve_location(response.headers(), "upload start")?;
        self.output
            .debug(&format!("Upload session for {} at {}", repository, location));
        Ok(UploadSession::new(repository, location))
    }

    async fn push_chunk(
        &self,
        session: &UploadSession,
        range: Range<u64>,
        data: &[u8],
    ) -> Result<UploadSession> {
        if range.end - range.start != data.len() as u64 || range.start != session.bytes_sent {
            return Err(PusherError::RegistryRejected {
                operation: "chunk upload".to_string(),
                status: 0,
                detail: format!(
                    "chunk range {}..{} does not continue session at {} with {} bytes",
                    range.start,
                    range.end,
                    session.bytes_sent,
                    data.len()
                ),
            });
        }
        if data.is_empty() {
            return Ok(session.clone());
        }

        let scope = push_scope(&session.repository);
        let content_range = format!("{}-{}", range.start, range.end - 1);
        let response = self
            .send(&scope, "chunk upload", &session.location, || {
                self.request(Method::PATCH, &session.location)
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .header(CONTENT_RANGE, content_range.as_str())
                    .header(CONTENT_LENGTH, data.len())
                    .body(data.to_vec())
            })
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            let (status, headers, text) = error_text(response).await;
            return Err(HttpErrorHandler::handle_registry_error(
                status,
                &headers,
                &text,
                "chunk upload",
            ));
        }

        let location = self.resolve_location(response.headers(), "chunk upload")?;
        let bytes_sent = received_bytes(response.headers()).unwrap_or(range.end);
        if bytes_sent != range.end {
            return Err(PusherError::RegistryRejected {
                operation: "chunk upload".to_string(),
                status: response.status().as_u16(),
                detail: format!(
                    "registry acknowledged {} bytes, expected {}",
                    bytes_sent, range.end
                ),
            });
        }

        Ok(UploadSession {
            repository: session.repository.clone(),
            location,
            bytes_sent,
        })
    }

    async fn complete_upload(&self, session: &UploadSession, digest: &str) -> Result<String> {
        let mut url = session.location.clone();
        url.query_pairs_mut().append_pair("digest", digest);
        let scope = push_scope(&session.repository);

        let response = self
            .send(&scope, "upload completion", &url, || {
                self.request(Method::PUT, &url)
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .header(CONTENT_LENGTH, "0")
            })
            .await?;

        let status = response.status();
        if !matches!(status.as_u16(), 201 | 204) {
            let (status, headers, text) = error_text(response).await;
            return Err(HttpErrorHandler::handle_completion_error(
                status, &headers, &text, digest,
            ));
        }

        match header_str(response.headers(), DOCKER_CONTENT_DIGEST) {
            Some(reported) if reported != digest => Err(PusherError::DigestMismatch {
                expected: digest.to_string(),
                actual: format!("registry stored blob as {}", reported),
            }),
            _ => {
                self.output.debug(&format!(
                    "Blob {} committed ({} bytes)",
                    DigestUtils::short(digest),
                    session.bytes_sent
                ));
                Ok(digest.to_string())
            }
        }
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        manifest: &[u8],
    ) -> Result<Option<String>> {
        let url = self.endpoint(&format!("v2/{}/manifests/{}", repository, reference))?;
        let scope = push_scope(repository);

        let response = self
            .send(&scope, "manifest upload", &url, || {
                self.request(Method::PUT, &url)
                    .header(CONTENT_TYPE, media_type)
                    .body(manifest.to_vec())
            })
            .await?;

        let status = response.status();
        if !matches!(status.as_u16(), 200 | 201 | 202) {
            let (status, headers, text) = error_text(response).await;
            return Err(HttpErrorHandler::handle_manifest_error(
                status,
                &headers,
                &text,
                &format!("{}:{}", repository, reference),
            ));
        }

        Ok(header_str(response.headers(), DOCKER_CONTENT_DIGEST).map(str::to_string))
    }
}
