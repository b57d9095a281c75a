//! User-visible output for a push run
//!
//! [`Logger`] is a small `Clone` value handed to every component. It decides what to
//! print from a [`Verbosity`] level and remembers when the run started, so summaries
//! can report elapsed time. Errors go to stderr at every level; everything else goes
//! to stdout.

use std::io::{self, Write};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Errors only
    Quiet,
    Normal,
    /// Adds per-request and per-entry detail
    Verbose,
}

#[derive(Debug, Clone)]
pub struct Logger {
    verbosity: Verbosity,
    started: Instant,
}

impl Default for Logger {
    fn default() -> Self {
        Self::with_verbosity(Verbosity::Normal)
    }
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self::with_verbosity(if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        })
    }

    pub fn new_quiet() -> Self {
        Self::with_verbosity(Verbosity::Quiet)
    }

    pub fn with_verbosity(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            started: Instant::now(),
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn is_verbose(&self) -> bool {
        self.verbosity >= Verbosity::Verbose
    }

    fn emit(&self, level: Verbosity, prefix: &str, message: &str) {
        if self.verbosity >= level {
            println!("{}{}", prefix, message);
        }
    }

    pub fn section(&self, title: &str) {
        self.emit(Verbosity::Normal, "\n=== ", &format!("{} ===", title));
    }

    pub fn subsection(&self, title: &str) {
        self.emit(Verbosity::Normal, "\n--- ", &format!("{} ---", title));
    }

    /// Verbose-only diagnostics, stamped with the time since the run started
    pub fn debug(&self, message: &str) {
        if self.is_verbose() {
            println!("🐛 [{:>8.3}s] {}", self.started.elapsed().as_secs_f64(), message);
        }
    }

    pub fn info(&self, message: &str) {
        self.emit(Verbosity::Normal, "ℹ️  ", message);
    }

    pub fn success(&self, message: &str) {
        self.emit(Verbosity::Normal, "✅ ", message);
    }

    pub fn warning(&self, message: &str) {
        self.emit(Verbosity::Normal, "⚠️  WARNING: ", message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("❌ ERROR: {}", message);
    }

    pub fn step(&self, message: &str) {
        self.emit(Verbosity::Normal, "▶️  ", message);
    }

    /// Indented line, verbose only
    pub fn detail(&self, message: &str) {
        self.emit(Verbosity::Verbose, "   ", message);
    }

    /// Rewrite the current line with a transfer progress indicator.
    ///
    /// `elapsed` is measured by the caller, so the rate covers the transfer
    /// rather than the whole run.
    pub fn progress(&self, current: u64, total: u64, operation: &str, elapsed: Duration) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }

        let percentage = if total == 0 {
            100.0
        } else {
            current as f64 * 100.0 / total as f64
        };
        let rate = match elapsed.as_secs_f64() {
            secs if secs > 0.0 => (current as f64 / secs) as u64,
            _ => 0,
        };

        let mut stdout = io::stdout().lock();
        let _ = write!(
            stdout,
            "\r⏳ {}: {:>5.1}% {}/{} at {}    ",
            operation,
            percentage,
            self.format_size(current),
            self.format_size(total),
            self.format_speed(rate)
        );
        let _ = stdout.flush();
    }

    pub fn progress_done(&self) {
        if self.verbosity > Verbosity::Quiet {
            println!();
        }
    }

    /// Titled block of `key: value` lines
    pub fn summary_kv(&self, title: &str, items: &[(&str, String)]) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        self.subsection(title);
        let width = items.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
        for (key, value) in items {
            println!("  {:<width$}  {}", format!("{}:", key), value, width = width + 1);
        }
    }

    /// Human-readable size in binary units
    pub fn format_size(&self, bytes: u64) -> String {
        const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
        if bytes < 1024 {
            return format!("{} B", bytes);
        }
        let mut value = bytes as f64 / 1024.0;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        format!("{:.1} {}", value, UNITS[unit])
    }

    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        match secs {
            0..60 => format!("{:.1}s", duration.as_secs_f64()),
            60..3600 => format!("{}m{}s", secs / 60, secs % 60),
            _ => format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60),
        }
    }

    pub fn format_speed(&self, bytes_per_sec: u64) -> String {
        format!("{}/s", self.format_size(bytes_per_sec))
    }

    /// Time since the logger was created
    pub fn elapsed(&self) -> String {
        self.format_duration(self.started.elapsed())
    }
}
