//! Configuration for a push run and target resolution
//!
//! [`PushConfig`] is the resolved, immutable configuration handed to the push engine.
//! It is normally produced from command-line arguments by [`crate::cli::Args`], but the
//! engine never looks at raw arguments itself.

use crate::error::{PusherError, Result};
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry base URL, scheme and authority only
    pub url: Url,
    pub skip_tls: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub concurrency: usize,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Optional rewrites applied to every repo tag found in the archive
#[derive(Debug, Clone, Default)]
pub struct TargetOverrides {
    pub repository: Option<String>,
    pub tag: Option<String>,
    pub replace_tags_match: Option<String>,
    pub replace_tags_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub archive_path: PathBuf,
    pub registry: RegistryConfig,
    pub auth: AuthConfig,
    pub upload: UploadConfig,
    pub retry: RetryConfig,
    pub overrides: TargetOverrides,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_RETRY_MAX_DELAY_SECS),
        }
    }
}

impl AuthConfig {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username: Some(username),
            password: Some(password),
        }
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

impl RegistryConfig {
    /// Parse a registry URL such as `localhost:5000`, `https://registry.example.com`
    /// or `https://registry.example.com/project/app:v1`.
    ///
    /// A missing scheme defaults to `http://`. A path, when present, is returned as
    /// a repository (and optional tag) override.
    pub fn parse_url(
        url: &str,
        skip_tls: bool,
        timeout: Duration,
    ) -> Result<(Self, Option<(String, Option<String>)>)> {
        let url = url.trim();
        if url.is_empty() {
            return Err(PusherError::Config("Registry URL cannot be empty".to_string()));
        }

        let with_scheme = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{}", url)
        };

        let parsed = Url::parse(&with_scheme)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PusherError::Config(format!(
                "Unsupported registry URL scheme: {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| PusherError::Config(format!("Registry URL has no host: {}", url)))?;

        let authority = match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        };
        let base = Url::parse(&authority)?;

        let path = parsed.path().trim_matches('/');
        let repository = if path.is_empty() {
            None
        } else {
            let (repo, reference) = split_repo_tag(path);
            Some((repo.to_string(), reference.map(str::to_string)))
        };

        Ok((
            RegistryConfig {
                url: base,
                skip_tls,
                timeout,
            },
            repository,
        ))
    }

    /// Host (and port) as used in log output and token scopes
    pub fn host(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or_default(), port),
            None => self.url.host_str().unwrap_or_default().to_string(),
        }
    }
}

impl PushConfig {
    pub fn new(archive_path: impl Into<PathBuf>, registry_url: &str) -> Result<Self> {
        let (registry, path_target) = RegistryConfig::parse_url(
            registry_url,
            false,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )?;

        let mut overrides = TargetOverrides::default();
        if let Some((repository, tag)) = path_target {
            overrides.repository = Some(repository);
            overrides.tag = tag;
        }

        Ok(Self {
            archive_path: archive_path.into(),
            registry,
            auth: AuthConfig::default(),
            upload: UploadConfig::default(),
            retry: RetryConfig::default(),
            overrides,
        })
    }

    pub fn has_auth(&self) -> bool {
        self.auth.credentials().is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload.concurrency == 0 {
            return Err(PusherError::Config("Concurrency must be greater than 0".to_string()));
        }
        if self.upload.chunk_size == 0 {
            return Err(PusherError::Config("Chunk size must be greater than 0".to_string()));
        }
        if self.registry.timeout.is_zero() {
            return Err(PusherError::Config("Timeout must be greater than 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PusherError::Config(
                "Retry attempts must be at least 1".to_string(),
            ));
        }

        match (&self.auth.username, &self.auth.password) {
            (Some(_), None) => {
                return Err(PusherError::Config(
                    "Password is required when username is provided".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(PusherError::Config(
                    "Username is required when password is provided".to_string(),
                ));
            }
            _ => {}
        }

        match (
            &self.overrides.replace_tags_match,
            &self.overrides.replace_tags_target,
        ) {
            (Some(pattern), Some(_)) => {
                tag_pattern(pattern)?;
            }
            (None, None) => {}
            _ => {
                return Err(PusherError::Config(
                    "--replace-tags-match and --replace-tags-target must be given together"
                        .to_string(),
                ));
            }
        }

        if let Some(repository) = &self.overrides.repository {
            validate_repository(repository)?;
        }

        Ok(())
    }
}

/// Tag or digest a manifest is published under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl Reference {
    pub fn parse(reference: &str) -> Self {
        if reference.starts_with("sha256:") {
            Reference::Digest(reference.to_string())
        } else {
            Reference::Tag(reference.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => digest,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved destination of one manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub repository: String,
    pub reference: Reference,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            Reference::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}

impl TargetOverrides {
    /// Resolve one archive repo tag (e.g. `library/nginx:1.25`) into a [`Target`].
    ///
    /// `repo_tag` may be `None` for untagged images, in which case a repository
    /// override is required.
    pub fn resolve(&self, repo_tag: Option<&str>) -> Result<Target> {
        let (archive_repo, archive_ref) = match repo_tag {
            Some(repo_tag) => {
                let (repo, reference) = split_repo_tag(repo_tag);
                (Some(repo), reference)
            }
            None => (None, None),
        };

        let repository = match (&self.repository, archive_repo) {
            (Some(repository), _) => repository.clone(),
            (None, Some(repo)) => strip_registry_host(repo).to_string(),
            (None, None) => {
                return Err(PusherError::Config(
                    "Image has no RepoTags; a target repository must be given".to_string(),
                ));
            }
        };

        let mut reference = match (&self.tag, archive_ref) {
            (Some(tag), _) => Reference::parse(tag),
            (None, Some(reference)) => Reference::parse(reference),
            (None, None) => Reference::Tag("latest".to_string()),
        };

        if let (Some(pattern), Some(replacement), Reference::Tag(tag)) = (
            &self.replace_tags_match,
            &self.replace_tags_target,
            &reference,
        ) {
            if tag_pattern(pattern)?.is_match(tag) {
                reference = Reference::Tag(replacement.clone());
            }
        }

        validate_repository(&repository)?;
        Ok(Target {
            repository,
            reference,
        })
    }
}

/// Tag rewrite patterns match from the start of the tag only.
fn tag_pattern(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{})", pattern))?)
}

/// Split `repo:tag` or `repo@sha256:...`. The tag separator is the last `:` after
/// the last `/`, so `host:5000/app` has no tag.
pub fn split_repo_tag(repo_tag: &str) -> (&str, Option<&str>) {
    if let Some((repo, digest)) = repo_tag.split_once('@') {
        return (repo, Some(digest));
    }
    let last_slash = repo_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    match repo_tag[last_slash..].rfind(':') {
        Some(pos) => {
            let colon = last_slash + pos;
            (&repo_tag[..colon], Some(&repo_tag[colon + 1..]))
        }
        None => (repo_tag, None),
    }
}

/// Drop a leading registry host component (`registry.example.com:5000/team/app`
/// becomes `team/app`); the target registry comes from the configuration.
fn strip_registry_host(repository: &str) -> &str {
    match repository.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            rest
        }
        _ => repository,
    }
}

fn validate_repository(repository: &str) -> Result<()> {
    let valid = !repository.is_empty()
        && repository.split('/').all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        });
    if valid {
        Ok(())
    } else {
        Err(PusherError::Config(format!(
            "Invalid repository name: {}",
            repository
        )))
    }
}
