// Run metrics module
//
// Lightweight counters for trial runs, the display and observer delivery

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Controller metrics
///
/// Uses atomic operations for thread-safe tracking without locks. One instance
/// is shared by a controller and its state machine and logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Images loaded, transformed and rendered successfully
    pub items_rendered: AtomicUsize,

    /// Images whose load, transform or render failed
    pub items_failed: AtomicUsize,

    /// Total per-item processing time in milliseconds
    pub total_render_time_ms: AtomicU64,

    pub runs_completed: AtomicUsize,
    pub runs_cancelled: AtomicUsize,

    /// run_test calls turned away (already running, not initialized, empty config)
    pub runs_rejected: AtomicUsize,

    /// Accepted state transitions
    pub state_transitions: AtomicU64,

    /// Successful observer callbacks
    pub observer_notifications: AtomicU64,

    /// Observer callbacks that panicked
    pub observer_failures: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            items_rendered: AtomicUsize::new(0),
            items_failed: AtomicUsize::new(0),
            total_render_time_ms: AtomicU64::new(0),
            runs_completed: AtomicUsize::new(0),
            runs_cancelled: AtomicUsize::new(0),
            runs_rejected: AtomicUsize::new(0),
            state_transitions: AtomicU64::new(0),
            observer_notifications: AtomicU64::new(0),
            observer_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record one processed image and how long it took
    pub fn record_item(&self, success: bool, duration: Duration) {
        if success {
            self.items_rendered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.items_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_render_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_cancelled(&self) {
        self.runs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_rejected(&self) {
        self.runs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_observer_notification(&self) {
        self.observer_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_observer_failure(&self) {
        self.observer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average processing time per image in milliseconds
    pub fn avg_render_time_ms(&self) -> f64 {
        let total = self.total_render_time_ms.load(Ordering::Relaxed);
        let count = self.items_rendered.load(Ordering::Relaxed)
            + self.items_failed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        let uptime = self.uptime();
        tracing::info!("=== Trial Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", uptime.as_secs_f64());
        tracing::info!(
            "Runs: {} completed, {} cancelled, {} rejected",
            self.runs_completed.load(Ordering::Relaxed),
            self.runs_cancelled.load(Ordering::Relaxed),
            self.runs_rejected.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Images: {} rendered, {} failed (avg: {:.2}ms per image)",
            self.items_rendered.load(Ordering::Relaxed),
            self.items_failed.load(Ordering::Relaxed),
            self.avg_render_time_ms()
        );
        tracing::info!(
            "State transitions: {}, observer calls: {}, observer failures: {}",
            self.state_transitions.load(Ordering::Relaxed),
            self.observer_notifications.load(Ordering::Relaxed),
            self.observer_failures.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.items_rendered.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.runs_completed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_items() {
        let metrics = Metrics::new();

        metrics.record_item(true, Duration::from_millis(100));
        metrics.record_item(true, Duration::from_millis(150));
        metrics.record_item(false, Duration::from_millis(50));

        assert_eq!(metrics.items_rendered.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.items_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_render_time_ms.load(Ordering::Relaxed), 300);
        assert_eq!(metrics.avg_render_time_ms(), 100.0);
    }

    #[test]
    fn test_avg_render_time_no_items() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_render_time_ms(), 0.0);
    }

    #[test]
    fn test_run_counters() {
        let metrics = Metrics::new();

        metrics.record_run_completed();
        metrics.record_run_cancelled();
        metrics.record_run_rejected();
        metrics.record_run_rejected();

        assert_eq!(metrics.runs_completed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.runs_cancelled.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.runs_rejected.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}
