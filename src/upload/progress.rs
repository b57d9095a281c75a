//! Upload progress shared by concurrent workers

use crate::logging::Logger;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Clone)]
pub struct ProgressTracker {
    total_size: u64,
    uploaded_size: Arc<AtomicU64>,
    start_time: Instant,
    label: String,
    output: Logger,
}

impl ProgressTracker {
    pub fn new(total_size: u64, output: Logger, label: impl Into<String>) -> Self {
        Self {
            total_size,
            uploaded_size: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
            label: label.into(),
            output,
        }
    }

    /// Record bytes the registry acknowledged
    pub fn update(&self, bytes: u64) {
        let uploaded = self.uploaded_size.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.output
            .progress(uploaded, self.total_size, &self.label, self.start_time.elapsed());
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded_size.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        let uploaded = self.uploaded();
        if uploaded == 0 {
            return;
        }
        self.output.progress_done();

        let elapsed = self.start_time.elapsed();
        let speed = if elapsed.as_secs_f64() > 0.0 {
            (uploaded as f64 / elapsed.as_secs_f64()) as u64
        } else {
            uploaded
        };
        self.output.info(&format!(
            "{}: {} in {} ({})",
            self.label,
            self.output.format_size(uploaded),
            self.output.format_duration(elapsed),
            self.output.format_speed(speed)
        ));
    }
}
