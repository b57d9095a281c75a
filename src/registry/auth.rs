//! Authentication module for Docker registry access
//!
//! Registries announce how to authenticate through a `WWW-Authenticate` challenge on
//! a 401 response. Bearer challenges are answered with a token from the realm named
//! in the challenge; Basic challenges with the configured credentials.

use crate::config::AuthConfig;
use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{PusherError, Result};
use crate::logging::Logger;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value.
    ///
    /// `Bearer realm="https://auth.example.com/token",service="registry",scope="repository:app:pull,push"`
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut params = parse_params(params);
        let realm = params.remove("realm")?;
        Some(Challenge::Bearer {
            realm,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }
}

/// Split `key="value",key2=value2` pairs; quoted values may contain commas.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        params.insert(key, value);
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

/// Credential attached to registry requests
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Bearer(token) => write!(f, "Bearer(<{} chars>)", token.len()),
            Credential::Basic { username, .. } => write!(f, "Basic({})", username),
        }
    }
}

impl Credential {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credential::Bearer(token) => request.bearer_auth(token),
            Credential::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Answers registry challenges with credentials
#[derive(Debug, Clone)]
pub struct Auth {
    client: Client,
    config: AuthConfig,
    output: Logger,
}

impl Auth {
    pub fn new(client: Client, config: AuthConfig, output: Logger) -> Self {
        Self {
            client,
            config,
            output,
        }
    }

    /// Obtain a credential satisfying `challenge` for `scope`
    /// (`repository:<name>:<actions>`).
    pub async fn authenticate(&self, challenge: &Challenge, scope: &str) -> Result<Credential> {
        match challenge {
            Challenge::Basic => {
                let (username, password) = self.config.credentials().ok_or_else(|| {
                    PusherError::Authentication(
                        "Registry requires basic authentication but no credentials were given"
                            .to_string(),
                    )
                })?;
                self.output
                    .detail(&format!("Using basic credentials for user {}", username));
                Ok(Credential::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            Challenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let scope = challenge_scope.as_deref().unwrap_or(scope);
                self.request_token(realm, service.as_deref(), scope).await
            }
        }
    }

    async fn request_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<Credential> {
        let mut url = Url::parse(realm).map_err(|e| {
            PusherError::Authentication(format!("Invalid token realm {}: {}", realm, e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", scope);
        }

        self.output
            .detail(&format!("Requesting token from {} for {}", realm, scope));

        let mut request = self.client.get(url);
        if let Some((username, password)) = self.config.credentials() {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "token request"))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_auth_error(status, &error_text));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            PusherError::Authentication(format!("Failed to parse token response: {}", e))
        })?;

        let token = token_response
            .token
            .or(token_response.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                PusherError::Authentication("Token response contained no token".to_string())
            })?;

        self.output
            .detail(&format!("Token obtained (length: {} chars)", token.len()));
        if let Some(expires_in) = token_response.expires_in {
            self.output
                .detail(&format!("Token expires in {} seconds", expires_in));
        }

        Ok(Credential::Bearer(token))
    }
}
