//! Image archive reader
//!
//! Reads a `docker save` tar archive in a single forward pass. The pass records, for
//! every regular member, where its data starts in the file, how long it is and its
//! content digest, and keeps the bytes of `manifest.json`. Blob contents are never
//! held in memory: they are re-read later by seeking straight to the recorded offset.

use crate::error::{PusherError, Result};
use crate::image::digest::{BlobHasher, DIGEST_PREFIX, DigestUtils};
use crate::image::manifest::{
    DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_GZIP_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE,
    OCI_LAYER_ZSTD_MEDIA_TYPE,
};
use crate::logging::Logger;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const INDEX_PATH: &str = "manifest.json";
const SNIFF_LEN: usize = 4;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const MAX_LINK_DEPTH: usize = 16;
/// Upper bound for `manifest.json`; the header size is untrusted
const MAX_INDEX_SIZE: u64 = 16 * 1024 * 1024;

/// Byte stream positioned at one archive member
pub type BlobReader = tokio::io::Take<tokio::fs::File>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// One regular file inside the archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    /// Offset of the member's data in the archive file
    pub offset: u64,
    pub size: u64,
    pub digest: String,
    pub compression: Compression,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerSource {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
}

/// One element of the archive's `manifest.json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageIndexEntry {
    pub config: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    pub layers: Vec<String>,
    #[serde(default)]
    pub layer_sources: HashMap<String, LayerSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Config,
    Layer,
}

/// A blob of one image, resolved against the archive members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub kind: BlobKind,
    /// Archive member holding the bytes
    pub path: String,
    pub digest: String,
    pub size: u64,
    pub media_type: String,
}

#[derive(Debug, Clone)]
pub struct ImageBlobs {
    pub repo_tags: Vec<String>,
    pub config: BlobDescriptor,
    pub layers: Vec<BlobDescriptor>,
}

impl ImageBlobs {
    /// Config first, then layers in manifest order
    pub fn all(&self) -> impl Iterator<Item = &BlobDescriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }

    pub fn total_size(&self) -> u64 {
        self.all().map(|b| b.size).sum()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ImageConfigSummary {
    pub architecture: Option<String>,
    pub os: Option<String>,
}

pub struct ImageArchive {
    path: PathBuf,
    entries: HashMap<String, ArchiveEntry>,
    links: HashMap<String, String>,
    images: Vec<ImageIndexEntry>,
}

impl ImageArchive {
    /// Scan the archive once and parse its index
    pub fn open(path: &Path, output: &Logger) -> Result<Self> {
        output.subsection("Scanning archive entries");
        output.info(&format!("Source: {}", path.display()));

        let file = File::open(path).map_err(|e| {
            PusherError::ArchiveFormat(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let mut archive = Archive::new(BufReader::with_capacity(1024 * 1024, file));

        let mut entries = HashMap::new();
        let mut links = HashMap::new();
        let mut index_data = None;

        let members = archive
            .entries()
            .map_err(|e| PusherError::ArchiveFormat(format!("Failed to read tar entries: {}", e)))?;

        for member in members {
            let mut member = member
                .map_err(|e| PusherError::ArchiveFormat(format!("Failed to read tar entry: {}", e)))?;
            let path = normalize_path(
                &member
                    .path()
                    .map_err(|e| {
                        PusherError::ArchiveFormat(format!("Failed to read entry path: {}", e))
                    })?
                    .to_string_lossy(),
            );

            match member.header().entry_type() {
                EntryType::Regular | EntryType::Continuous => {}
                EntryType::Symlink | EntryType::Link => {
                    if let Ok(Some(target)) = member.link_name() {
                        let target = target.to_string_lossy().to_string();
                        let resolved = if member.header().entry_type() == EntryType::Symlink {
                            resolve_relative(&path, &target)
                        } else {
                            normalize_path(&target)
                        };
                        output.debug(&format!("Link {} -> {}", path, resolved));
                        links.insert(path, resolved);
                    }
                    continue;
                }
                _ => continue,
            }

            let offset = member.raw_file_position();
            let declared_size = member.size();

            if path == INDEX_PATH {
                if declared_size > MAX_INDEX_SIZE {
                    return Err(PusherError::ArchiveFormat(format!(
                        "{} declares {} bytes, more than the {} byte limit",
                        INDEX_PATH, declared_size, MAX_INDEX_SIZE
                    )));
                }
                let mut data = Vec::new();
                member.read_to_end(&mut data).map_err(|e| {
                    PusherError::ArchiveFormat(format!("Failed to read {}: {}", INDEX_PATH, e))
                })?;
                index_data = Some(data);
                continue;
            }

            let (digest, size, compression) = hash_member(&mut member)?;
            if size != declared_size {
                return Err(PusherError::ArchiveFormat(format!(
                    "Entry {} is truncated: header says {} bytes, read {}",
                    path, declared_size, size
                )));
            }
            check_content_addressed_path(&path, &digest)?;

            output.detail(&format!(
                "Entry {} ({}) {}",
                path,
                output.format_size(size),
                DigestUtils::short(&digest)
            ));
            entries.insert(
                path.clone(),
                ArchiveEntry {
                    path,
                    offset,
                    size,
                    digest,
                    compression,
                },
            );
        }

        let index_data = index_data.ok_or_else(|| {
            PusherError::ArchiveFormat(format!("No {} found in archive", INDEX_PATH))
        })?;
        let images: Vec<ImageIndexEntry> = serde_json::from_slice(&index_data).map_err(|e| {
            PusherError::ArchiveFormat(format!("Failed to parse {}: {}", INDEX_PATH, e))
        })?;
        if images.is_empty() {
            return Err(PusherError::ArchiveFormat(format!(
                "{} lists no images",
                INDEX_PATH
            )));
        }

        let archive = Self {
            path: path.to_path_buf(),
            entries,
            links,
            images,
        };

        // Every referenced member must exist before any network work starts
        for index in 0..archive.images.len() {
            archive.image_blobs(index)?;
        }

        output.success(&format!(
            "Indexed {} entries, {} image(s)",
            archive.entries.len(),
            archive.images.len()
        ));
        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn images(&self) -> &[ImageIndexEntry] {
        &self.images
    }

    /// Look up a member, following links
    pub fn entry(&self, path: &str) -> Result<&ArchiveEntry> {
        let mut current = normalize_path(path);
        for _ in 0..MAX_LINK_DEPTH {
            if let Some(entry) = self.entries.get(&current) {
                return Ok(entry);
            }
            match self.links.get(&current) {
                Some(target) => current = target.clone(),
                None => break,
            }
        }
        Err(PusherError::ArchiveFormat(format!(
            "Index references {} which is not in the archive",
            path
        )))
    }

    /// Resolve config and layers of the image at `index` in `manifest.json`
    pub fn image_blobs(&self, index: usize) -> Result<ImageBlobs> {
        let image = self.images.get(index).ok_or_else(|| {
            PusherError::ArchiveFormat(format!("No image at index {} in {}", index, INDEX_PATH))
        })?;

        if image.config.is_empty() {
            return Err(PusherError::ArchiveFormat(format!(
                "Image {} has no Config",
                index
            )));
        }

        let config_entry = self.entry(&image.config)?;
        let config = BlobDescriptor {
            kind: BlobKind::Config,
            path: config_entry.path.clone(),
            digest: config_entry.digest.clone(),
            size: config_entry.size,
            media_type: DOCKER_CONFIG_MEDIA_TYPE.to_string(),
        };

        let layers = image
            .layers
            .iter()
            .map(|layer| {
                let entry = self.entry(layer)?;
                let media_type = image
                    .layer_sources
                    .get(&entry.digest)
                    .map(|source| source.media_type.clone())
                    .unwrap_or_else(|| detect_media_type(entry.compression).to_string());
                Ok(BlobDescriptor {
                    kind: BlobKind::Layer,
                    path: entry.path.clone(),
                    digest: entry.digest.clone(),
                    size: entry.size,
                    media_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ImageBlobs {
            repo_tags: image.repo_tags.clone().unwrap_or_default(),
            config,
            layers,
        })
    }

    /// Open a fresh stream over one member's bytes
    pub async fn open_blob(&self, entry: &ArchiveEntry) -> Result<BlobReader> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(entry.offset)).await?;
        Ok(file.take(entry.size))
    }

    /// Read a small member fully into memory
    pub fn read_entry(&self, path: &str) -> Result<Vec<u8>> {
        let entry = self.entry(path)?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut data = Vec::with_capacity(entry.size as usize);
        file.take(entry.size).read_to_end(&mut data)?;
        Ok(data)
    }

    /// Architecture and OS from an image config, for display only
    pub fn config_summary(&self, config_path: &str) -> ImageConfigSummary {
        self.read_entry(config_path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default()
    }
}

fn hash_member<R: Read>(reader: &mut R) -> Result<(String, u64, Compression)> {
    let mut hasher = BlobHasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut head = Vec::with_capacity(SNIFF_LEN);
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(n);
            head.extend_from_slice(&buffer[..take]);
        }
        hasher.update(&buffer[..n]);
    }
    let size = hasher.bytes();
    Ok((hasher.finish(), size, sniff_compression(&head)))
}

fn sniff_compression(head: &[u8]) -> Compression {
    if head.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else if head.starts_with(&ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

fn detect_media_type(compression: Compression) -> &'static str {
    match compression {
        Compression::Gzip => DOCKER_LAYER_GZIP_MEDIA_TYPE,
        Compression::Zstd => OCI_LAYER_ZSTD_MEDIA_TYPE,
        Compression::None => DOCKER_LAYER_MEDIA_TYPE,
    }
}

/// `blobs/sha256/<hex>` members name their own digest; it has to agree with the content.
fn check_content_addressed_path(path: &str, digest: &str) -> Result<()> {
    if let Some(hex_part) = path.strip_prefix("blobs/sha256/") {
        if DigestUtils::is_valid_sha256_hex(hex_part) && digest[DIGEST_PREFIX.len()..] != *hex_part {
            return Err(PusherError::DigestMismatch {
                expected: format!("{}{}", DIGEST_PREFIX, hex_part),
                actual: format!("archive member {} hashes to {}", path, digest),
            });
        }
    }
    Ok(())
}

fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn resolve_relative(link_path: &str, target: &str) -> String {
    if target.starts_with('/') {
        return normalize_path(target);
    }
    match link_path.rsplit_once('/') {
        Some((dir, _)) => normalize_path(&format!("{}/{}", dir, target)),
        None => normalize_path(target),
    }
}
