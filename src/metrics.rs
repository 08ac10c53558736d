// Mirroring metrics module
//
// Lock-free counters shared by every watcher and the action queue

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Engine-wide counters.
///
/// Uses atomic operations so watchers and the queue worker can record
/// without coordinating. A summary is logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Completed scan cycles across all pairs
    pub scans: AtomicU64,

    /// Paths that could not be read during a scan
    pub scan_errors: AtomicU64,

    /// Actions accepted by the queue
    pub actions_submitted: AtomicU64,

    /// Actions the worker finished, successfully or not. Only ever increases.
    pub actions_completed: AtomicU64,

    /// Actions that ended in an error
    pub actions_failed: AtomicU64,

    /// Successful actions slower than the slow threshold
    pub actions_slow: AtomicU64,

    /// Actions dropped because a wipe of their pair superseded them
    pub actions_superseded: AtomicU64,

    /// Bytes written by copy actions
    pub bytes_copied: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            scans: AtomicU64::new(0),
            scan_errors: AtomicU64::new(0),
            actions_submitted: AtomicU64::new(0),
            actions_completed: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
            actions_slow: AtomicU64::new(0),
            actions_superseded: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_scan(&self, errors: usize) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.scan_errors.fetch_add(errors as u64, Ordering::Relaxed);
    }

    pub fn record_submitted(&self) {
        self.actions_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_superseded(&self, count: usize) {
        self.actions_superseded
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a finished action and return its completion number (1-based)
    pub fn record_completed(&self, failed: bool, slow: bool, bytes: u64) -> u64 {
        if failed {
            self.actions_failed.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.actions_slow.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
        self.actions_completed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn completed(&self) -> u64 {
        self.actions_completed.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn log_summary(&self) {
        tracing::info!("=== Mirroring Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Scans: {} ({} scan errors)",
            self.scans.load(Ordering::Relaxed),
            self.scan_errors.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Actions: {} submitted, {} completed, {} failed, {} slow, {} superseded",
            self.actions_submitted.load(Ordering::Relaxed),
            self.actions_completed.load(Ordering::Relaxed),
            self.actions_failed.load(Ordering::Relaxed),
            self.actions_slow.load(Ordering::Relaxed),
            self.actions_superseded.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Copied {} bytes",
            self.bytes_copied.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
