//! Upload module for scheduling blobs, chunked transfer and progress tracking

pub mod chunked;
pub mod progress;
pub mod scheduler;

pub use chunked::ChunkedUploader;
pub use progress::ProgressTracker;
pub use scheduler::{DigestLocks, ScheduleReport, UploadScheduler};
