#![allow(dead_code)]

use async_trait::async_trait;
use docker_registry_pusher::config::PushConfig;
use docker_registry_pusher::error::{PusherError, Result};
use docker_registry_pusher::image::DigestUtils;
use docker_registry_pusher::registry::{RegistryApi, UploadSession};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

// ---------------------------------------------------------------------------
// Archives
// ---------------------------------------------------------------------------

pub struct TestImage {
    pub repo_tags: Vec<String>,
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
}

impl TestImage {
    pub fn new<L: AsRef<[u8]>>(repo_tags: &[&str], layers: impl IntoIterator<Item = L>) -> Self {
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": [] },
            "tags": repo_tags,
        });
        Self {
            repo_tags: repo_tags.iter().map(|t| t.to_string()).collect(),
            config: serde_json::to_vec(&config).unwrap(),
            layers: layers.into_iter().map(|l| l.as_ref().to_vec()).collect(),
        }
    }

    pub fn config_digest(&self) -> String {
        DigestUtils::compute_digest(&self.config)
    }

    pub fn layer_digests(&self) -> Vec<String> {
        self.layers
            .iter()
            .map(|l| DigestUtils::compute_digest(l))
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `<id>/layer.tar` and `<hex>.json`, entries prefixed with `./`
    Legacy,
    /// `blobs/sha256/<hex>`
    ContentAddressed,
}

pub fn append(builder: &mut tar::Builder<std::fs::File>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

pub fn write_archive(dir: &Path, images: &[TestImage], layout: Layout) -> PathBuf {
    let path = dir.join("image.tar");
    let mut builder = tar::Builder::new(std::fs::File::create(&path).unwrap());
    let mut written = HashSet::new();
    let mut index = Vec::new();

    for image in images {
        let config_hex = image.config_digest()[7..].to_string();
        let config_path = match layout {
            Layout::Legacy => format!("{}.json", config_hex),
            Layout::ContentAddressed => format!("blobs/sha256/{}", config_hex),
        };
        if written.insert(config_path.clone()) {
            let name = match layout {
                Layout::Legacy => format!("./{}", config_path),
                Layout::ContentAddressed => config_path.clone(),
            };
            append(&mut builder, &name, &image.config);
        }

        let mut layer_paths = Vec::new();
        for layer in &image.layers {
            let hex = DigestUtils::compute_digest(layer)[7..].to_string();
            let layer_path = match layout {
                Layout::Legacy => format!("{}/layer.tar", hex),
                Layout::ContentAddressed => format!("blobs/sha256/{}", hex),
            };
            if written.insert(layer_path.clone()) {
                append(&mut builder, &layer_path, layer);
            }
            layer_paths.push(layer_path);
        }

        index.push(serde_json::json!({
            "Config": config_path,
            "RepoTags": image.repo_tags,
            "Layers": layer_paths,
        }));
    }

    append(
        &mut builder,
        "manifest.json",
        &serde_json::to_vec(&index).unwrap(),
    );
    builder.finish().unwrap();
    path
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Deterministic pseudo-random bytes, so layers of equal length still differ
pub fn bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7) as u8)
        .collect()
}

pub fn config_for(archive: &Path) -> PushConfig {
    let mut config = PushConfig::new(archive, "http://registry.test").unwrap();
    config.upload.chunk_size = 64;
    config.upload.concurrency = 3;
    config.retry.base_delay = Duration::from_millis(100);
    config.retry.max_delay = Duration::from_secs(2);
    config
}

// ---------------------------------------------------------------------------
// Instrumented in-memory registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exists { repository: String, digest: String },
    Start { repository: String },
    Chunk { session: usize, start: u64, end: u64 },
    Complete { session: usize, digest: String },
    Manifest { repository: String, reference: String },
}

struct OpenSession {
    repository: String,
    data: Vec<u8>,
    opened_at: usize,
}

/// One finished upload transaction, in logical clock ticks
#[derive(Debug, Clone)]
pub struct SessionSpan {
    pub repository: String,
    pub digest: String,
    pub opened_at: usize,
    pub closed_at: usize,
}

#[derive(Default)]
struct State {
    blobs: HashMap<(String, String), u64>,
    sessions: HashMap<usize, OpenSession>,
    spans: Vec<SessionSpan>,
    manifests: Vec<(String, String, Vec<u8>)>,
    calls: Vec<Call>,
    active: usize,
    max_active: usize,
}

#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<State>,
    clock: AtomicUsize,
    next_session: AtomicUsize,
    /// Chunk pushes that fail with a 503 before succeeding
    pub chunk_failures: AtomicUsize,
    /// Completions answered as if the registry refused the digest
    pub reject_digest: Mutex<bool>,
    /// Upload starts refused with 403
    pub reject_uploads: Mutex<bool>,
    /// Simulated latency of a chunk push
    pub chunk_delay: Mutex<Duration>,
    chunk_times: Mutex<Vec<tokio::time::Instant>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        let registry = Self::default();
        *registry.chunk_delay.lock().unwrap() = Duration::from_millis(1);
        registry
    }

    pub fn seed_blob(&self, repository: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.blobs.insert(
            (repository.to_string(), DigestUtils::compute_digest(content)),
            content.len() as u64,
        );
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .blobs
            .contains_key(&(repository.to_string(), digest.to_string()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// When each chunk push arrived, in order
    pub fn chunk_times(&self) -> Vec<tokio::time::Instant> {
        self.chunk_times.lock().unwrap().clone()
    }

    pub fn spans(&self) -> Vec<SessionSpan> {
        self.state.lock().unwrap().spans.clone()
    }

    pub fn max_active_sessions(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    pub fn manifests(&self) -> Vec<(String, String, serde_json::Value)> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .iter()
            .map(|(repo, reference, body)| {
                (
                    repo.clone(),
                    reference.clone(),
                    serde_json::from_slice(body).unwrap(),
                )
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    fn tick(&self) -> usize {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn session_id(session: &UploadSession) -> usize {
    session
        .location
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|id| id.parse().ok())
        .unwrap()
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        self.record(Call::Exists {
            repository: repository.to_string(),
            digest: digest.to_string(),
        });
        Ok(self.has_blob(repository, digest))
    }

    async fn start_upload(&self, repository: &str) -> Result<UploadSession> {
        self.record(Call::Start {
            repository: repository.to_string(),
        });
        if *self.reject_uploads.lock().unwrap() {
            return Err(PusherError::RegistryRejected {
                operation: "upload start".to_string(),
                status: 403,
                detail: "DENIED".to_string(),
            });
        }

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let opened_at = self.tick();
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(
            id,
            OpenSession {
                repository: repository.to_string(),
                data: Vec::new(),
                opened_at,
            },
        );
        state.active += 1;
        state.max_active = state.max_active.max(state.active);

        let location = Url::parse(&format!(
            "http://registry.test/v2/{}/blobs/uploads/{}",
            repository, id
        ))
        .unwrap();
        Ok(UploadSession::new(repository, location))
    }

    async fn push_chunk(
        &self,
        session: &UploadSession,
        range: Range<u64>,
        data: &[u8],
    ) -> Result<UploadSession> {
        self.chunk_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        let id = session_id(session);
        self.record(Call::Chunk {
            session: id,
            start: range.start,
            end: range.end,
        });

        let delay = *self.chunk_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let failures = self.chunk_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.chunk_failures.store(failures - 1, Ordering::SeqCst);
            return Err(PusherError::Network {
                message: "Registry unavailable during chunk upload".to_string(),
                status: Some(503),
                retry_after: None,
            });
        }

        let mut state = self.state.lock().unwrap();
        let open = state.sessions.get_mut(&id).unwrap();
        if open.data.len() as u64 != range.start {
            return Err(PusherError::RegistryRejected {
                operation: "chunk upload".to_string(),
                status: 416,
                detail: format!("expected offset {}", open.data.len()),
            });
        }
        open.data.extend_from_slice(data);

        Ok(UploadSession {
            repository: session.repository.clone(),
            location: session.location.clone(),
            bytes_sent: open.data.len() as u64,
        })
    }

    async fn complete_upload(&self, session: &UploadSession, digest: &str) -> Result<String> {
        let id = session_id(session);
        self.record(Call::Complete {
            session: id,
            digest: digest.to_string(),
        });

        let closed_at = self.tick();
        let reject = *self.reject_digest.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        let open = state.sessions.remove(&id).unwrap();
        state.active -= 1;

        let actual = DigestUtils::compute_digest(&open.data);
        if reject || actual != digest {
            return Err(PusherError::DigestMismatch {
                expected: digest.to_string(),
                actual: format!("registry rejected digest: DIGEST_INVALID ({})", actual),
            });
        }

        state.blobs.insert(
            (open.repository.clone(), digest.to_string()),
            open.data.len() as u64,
        );
        state.spans.push(SessionSpan {
            repository: open.repository,
            digest: digest.to_string(),
            opened_at: open.opened_at,
            closed_at,
        });
        Ok(digest.to_string())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        _media_type: &str,
        manifest: &[u8],
    ) -> Result<Option<String>> {
        self.record(Call::Manifest {
            repository: repository.to_string(),
            reference: reference.to_string(),
        });

        let parsed: serde_json::Value = serde_json::from_slice(manifest).unwrap();
        let mut referenced = vec![parsed["config"]["digest"].as_str().unwrap().to_string()];
        for layer in parsed["layers"].as_array().unwrap() {
            referenced.push(layer["digest"].as_str().unwrap().to_string());
        }

        let mut state = self.state.lock().unwrap();
        for digest in referenced {
            if !state
                .blobs
                .contains_key(&(repository.to_string(), digest.clone()))
            {
                return Err(PusherError::ManifestRejected {
                    reference: format!("{}:{}", repository, reference),
                    status: 400,
                    detail: format!("MANIFEST_BLOB_UNKNOWN {}", digest),
                });
            }
        }
        state.manifests.push((
            repository.to_string(),
            reference.to_string(),
            manifest.to_vec(),
        ));
        Ok(Some(DigestUtils::compute_digest(manifest)))
    }
}
