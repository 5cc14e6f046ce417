//! Capture statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Point-in-time statistics of one capture
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureStats {
    /// Frames read from the taps
    pub frames_seen: u64,
    /// Frames that passed every filter and were handed to the sinks
    pub packets_accepted: u64,
    /// Frames rejected by a filter
    pub packets_filtered: u64,
    /// Bytes of accepted frames (captured length)
    pub bytes_accepted: u64,
    /// Sink deliveries that failed
    pub delivery_failures: u64,
    /// Capture duration
    pub duration: Duration,
    /// Accepted packets per second
    pub packets_per_second: f64,
    /// Accepted bytes per second
    pub bytes_per_second: f64,
}

impl CaptureStats {
    /// Share of seen frames rejected by the filters, in percent
    pub fn filter_rate(&self) -> f64 {
        if self.frames_seen == 0 {
            return 0.0;
        }
        (self.packets_filtered as f64 / self.frames_seen as f64) * 100.0
    }

    /// Whether any sink delivery failed
    pub fn has_failures(&self) -> bool {
        self.delivery_failures > 0
    }

    /// Format statistics as human-readable string
    pub fn format(&self) -> String {
        format!(
            "Seen: {} frames\n\
             Accepted: {} packets ({} bytes)\n\
             Filtered: {} frames ({:.2}%)\n\
             Delivery failures: {}\n\
             Duration: {:.2}s\n\
             Rate: {:.2} pps, {:.2} KB/s",
            self.frames_seen,
            self.packets_accepted,
            self.bytes_accepted,
            self.packets_filtered,
            self.filter_rate(),
            self.delivery_failures,
            self.duration.as_secs_f64(),
            self.packets_per_second,
            self.bytes_per_second / 1024.0
        )
    }
}

/// Thread-safe statistics accumulator shared by the taps of one capture
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    frames_seen: Arc<AtomicU64>,
    packets_accepted: Arc<AtomicU64>,
    packets_filtered: Arc<AtomicU64>,
    bytes_accepted: Arc<AtomicU64>,
    delivery_failures: Arc<AtomicU64>,
    start_time: Instant,
}

impl StatsAccumulator {
    /// Create a new statistics accumulator
    pub fn new() -> Self {
        Self {
            frames_seen: Arc::new(AtomicU64::new(0)),
            packets_accepted: Arc::new(AtomicU64::new(0)),
            packets_filtered: Arc::new(AtomicU64::new(0)),
            bytes_accepted: Arc::new(AtomicU64::new(0)),
            delivery_failures: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Record a frame read from a tap
    pub fn record_seen(&self) {
        self.frames_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame rejected by a filter
    pub fn record_filtered(&self) {
        self.packets_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted packet
    ///
    /// Called before delivery, so the count covers packets whose delivery
    /// is still in progress.
    pub fn record_accepted(&self, size: usize) {
        self.packets_accepted.fetch_add(1, Ordering::SeqCst);
        self.bytes_accepted.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a failed sink delivery
    pub fn record_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Accepted packet count
    pub fn accepted(&self) -> u64 {
        self.packets_accepted.load(Ordering::SeqCst)
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> CaptureStats {
        let packets_accepted = self.accepted();
        let bytes_accepted = self.bytes_accepted.load(Ordering::Relaxed);
        let duration = self.start_time.elapsed();

        let secs = duration.as_secs_f64();
        let (packets_per_second, bytes_per_second) = if secs > 0.0 {
            (packets_accepted as f64 / secs, bytes_accepted as f64 / secs)
        } else {
            (0.0, 0.0)
        };

        CaptureStats {
            frames_seen: self.frames_seen.load(Ordering::Relaxed),
            packets_accepted,
            packets_filtered: self.packets_filtered.load(Ordering::Relaxed),
            bytes_accepted,
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            duration,
            packets_per_second,
            bytes_per_second,
        }
    }

    /// Get elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
