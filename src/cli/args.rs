//! Command-line argument parsing

use crate::config::{AuthConfig, PushConfig, RegistryConfig, RetryConfig, UploadConfig};
use crate::config::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_RETRY_ATTEMPTS};
use crate::config::{DEFAULT_RETRY_DELAY_MS, DEFAULT_TIMEOUT_SECS, TargetOverrides};
use crate::error::{PusherError, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "REGISTRY_PUSHER_";

#[derive(Parser, Debug, Clone)]
#[command(name = "docker-registry-pusher")]
#[command(about = "Push a docker-save image archive straight to a registry over the HTTP API V2")]
#[command(version)]
pub struct Args {
    /// Path to the image archive produced by `docker save`
    #[arg(value_name = "ARCHIVE_PATH")]
    pub archive: PathBuf,

    /// Registry URL, optionally with a repository and tag (`registry:5000/team/app:v1`)
    #[arg(value_name = "REGISTRY_URL")]
    pub registry_url: String,

    #[arg(long, short = 'u', help = "Username for registry authentication")]
    pub username: Option<String>,

    #[arg(long, short = 'p', help = "Password for registry authentication")]
    pub password: Option<String>,

    #[arg(long, help = "Push every image to this repository instead of its own")]
    pub repository: Option<String>,

    #[arg(long, help = "Push every image under this tag instead of its own")]
    pub tag: Option<String>,

    #[arg(
        long = "replace-tags-match",
        requires = "replace_tags_target",
        help = "Regular expression selecting tags to rewrite"
    )]
    pub replace_tags_match: Option<String>,

    #[arg(
        long = "replace-tags-target",
        requires = "replace_tags_match",
        help = "Tag substituted for tags matching --replace-tags-match"
    )]
    pub replace_tags_target: Option<String>,

    #[arg(
        long,
        short = 'j',
        default_value_t = DEFAULT_CONCURRENCY,
        help = "Number of concurrent blob uploads"
    )]
    pub concurrency: usize,

    #[arg(
        long = "chunk-size",
        short = 'c',
        default_value_t = DEFAULT_CHUNK_SIZE,
        help = "Chunk size for upload in bytes"
    )]
    pub chunk_size: usize,

    #[arg(
        long,
        short = 't',
        default_value_t = DEFAULT_TIMEOUT_SECS,
        help = "Timeout for each network operation in seconds"
    )]
    pub timeout: u64,

    #[arg(
        long,
        default_value_t = DEFAULT_RETRY_ATTEMPTS,
        help = "Attempts per registry operation before giving up"
    )]
    pub retry: u32,

    #[arg(
        long = "retry-delay-ms",
        default_value_t = DEFAULT_RETRY_DELAY_MS,
        help = "Base delay before the first retry, doubled on each further attempt"
    )]
    pub retry_delay_ms: u64,

    #[arg(long = "skip-tls", short = 'k', help = "Skip TLS certificate verification")]
    pub skip_tls: bool,

    #[arg(long, short = 'v', conflicts_with = "quiet", help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, short = 'q', help = "Only print errors")]
    pub quiet: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse().from_env()
    }

    /// Fill unset options from `REGISTRY_PUSHER_*` environment variables
    pub fn from_env(self) -> Self {
        self.with_env_lookup(|name| std::env::var(name).ok())
    }

    fn with_env_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if self.username.is_none() {
            self.username = var("USERNAME");
        }
        if self.password.is_none() {
            self.password = var("PASSWORD");
        }

        if self.concurrency == DEFAULT_CONCURRENCY {
            if let Some(c) = var("CONCURRENCY").and_then(|v| v.parse().ok()) {
                self.concurrency = c;
            }
        }
        if self.chunk_size == DEFAULT_CHUNK_SIZE {
            if let Some(c) = var("CHUNK_SIZE").and_then(|v| v.parse().ok()) {
                self.chunk_size = c;
            }
        }
        if self.timeout == DEFAULT_TIMEOUT_SECS {
            if let Some(t) = var("TIMEOUT").and_then(|v| v.parse().ok()) {
                self.timeout = t;
            }
        }

        if var("SKIP_TLS").is_some_and(|v| is_truthy(&v)) {
            self.skip_tls = true;
        }
        if !self.quiet && var("VERBOSE").is_some_and(|v| is_truthy(&v)) {
            self.verbose = true;
        }

        self
    }

    /// Resolve into the configuration consumed by the push engine
    pub fn into_config(self) -> Result<PushConfig> {
        let (registry, path_target) = RegistryConfig::parse_url(
            &self.registry_url,
            self.skip_tls,
            Duration::from_secs(self.timeout),
        )?;

        let (path_repository, path_tag) = match path_target {
            Some((repository, tag)) => (Some(repository), tag),
            None => (None, None),
        };

        if !self.archive.is_file() {
            return Err(PusherError::Config(format!(
                "Archive does not exist: {}",
                self.archive.display()
            )));
        }

        let config = PushConfig {
            archive_path: self.archive,
            registry,
            auth: AuthConfig {
                username: self.username,
                password: self.password,
            },
            upload: UploadConfig {
                concurrency: self.concurrency,
                chunk_size: self.chunk_size,
            },
            retry: RetryConfig {
                max_attempts: self.retry,
                base_delay: Duration::from_millis(self.retry_delay_ms),
                ..RetryConfig::default()
            },
            overrides: TargetOverrides {
                repository: self.repository.or(path_repository),
                tag: self.tag.or(path_tag),
                replace_tags_match: self.replace_tags_match,
                replace_tags_target: self.replace_tags_target,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["docker-registry-pusher"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_configuration_constants() {
        let args = parse(&["image.tar", "localhost:5000"]);
        assert_eq!(args.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(args.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(args.timeout, DEFAULT_TIMEOUT_SECS);
        assert_eq!(args.retry, DEFAULT_RETRY_ATTEMPTS);
        assert!(!args.skip_tls);
    }

    #[test]
    fn tag_rewrite_options_must_come_together() {
        let argv = [
            "docker-registry-pusher",
            "image.tar",
            "localhost:5000",
            "--replace-tags-match",
            "^dev-",
        ];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn environment_fills_only_unset_options() {
        let env: HashMap<&str, &str> = [
            ("REGISTRY_PUSHER_USERNAME", "env-user"),
            ("REGISTRY_PUSHER_PASSWORD", "env-pass"),
            ("REGISTRY_PUSHER_CONCURRENCY", "8"),
            ("REGISTRY_PUSHER_SKIP_TLS", "true"),
            ("REGISTRY_PUSHER_VERBOSE", "0"),
        ]
        .into_iter()
        .collect();

        let args = parse(&["image.tar", "localhost:5000", "-u", "cli-user"])
            .with_env_lookup(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(args.username.as_deref(), Some("cli-user"));
        assert_eq!(args.password.as_deref(), Some("env-pass"));
        assert_eq!(args.concurrency, 8);
        assert!(args.skip_tls);
        assert!(!args.verbose);
    }

    #[test]
    fn registry_path_becomes_target_override() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("image.tar");
        std::fs::write(&archive, b"").unwrap();

        let args = parse(&[
            archive.to_str().unwrap(),
            "http://registry.local:5000/team/app:v2",
            "--retry",
            "5",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.registry.url.as_str(), "http://registry.local:5000/");
        assert_eq!(config.overrides.repository.as_deref(), Some("team/app"));
        assert_eq!(config.overrides.tag.as_deref(), Some("v2"));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn missing_archive_is_a_config_error() {
        let args = parse(&["/nonexistent/image.tar", "localhost:5000"]);
        assert!(matches!(args.into_config(), Err(PusherError::Config(_))));
    }
}
