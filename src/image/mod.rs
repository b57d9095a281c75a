//! Docker image archive handling
//!
//! This module reads `docker save` tar archives and turns their contents into what the
//! registry needs: content digests for every blob ([`digest`]), an offset index over the
//! archive members ([`archive`]) and the manifest published once all blobs are in
//! place ([`manifest`]).

pub mod archive;
pub mod digest;
pub mod manifest;

pub use archive::{ArchiveEntry, BlobDescriptor, BlobKind, ImageArchive, ImageBlobs};
pub use digest::{BlobHasher, DigestUtils};
pub use manifest::{BlobStatus, ConfirmedBlob, Manifest, ManifestAssembler};
