//! Docker Registry Pusher Library
//!
//! Pushes the images of a `docker save` archive to a registry over the Registry HTTP
//! API V2, without a Docker daemon. The archive is indexed in one pass, blobs are
//! uploaded in parallel with deduplication and retries, and a manifest is published
//! per target only after every blob it references is confirmed on the registry.

pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod pusher;
pub mod registry;
pub mod upload;

pub use config::PushConfig;
pub use error::{PusherError, Result};
pub use logging::Logger;
pub use pusher::{ImagePusher, PushSummary};
