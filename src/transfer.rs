//! Transfer progress accounting
//!
//! A [`TransferProgress`] is shared between the task moving bytes and the
//! reporter that periodically renders it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Byte counter for one transfer
#[derive(Debug)]
pub struct TransferProgress {
    seen: AtomicU64,
    total: u64,
    started: Instant,
}

impl TransferProgress {
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            seen: AtomicU64::new(0),
            total,
            started: Instant::now(),
        }
    }

    /// Records `bytes` more transferred bytes.
    pub fn add(&self, bytes: u64) {
        self.seen.fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::compute(self.seen(), self.total, self.elapsed())
    }
}

/// Point-in-time view of a transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub seen: u64,
    pub total: u64,
    /// 0.0 to 100.0
    pub percent: f64,
    /// Bytes per second since the start
    pub speed: f64,
    /// `None` while the speed is unknown or once the transfer is complete
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(seen: u64, total: u64, elapsed: Duration) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            (seen as f64 * 100.0 / total as f64).min(100.0)
        };

        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { seen as f64 / secs } else { 0.0 };

        let remaining = total.saturating_sub(seen);
        let eta = if speed > 0.0 && remaining > 0 {
            Some(Duration::from_secs_f64(remaining as f64 / speed))
        } else {
            None
        };

        Self {
            seen,
            total,
            percent,
            speed,
            eta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_halfway() {
        let snap = ProgressSnapshot::compute(50, 100, Duration::from_secs(10));
        assert!((snap.percent - 50.0).abs() < f64::EPSILON);
        assert!((snap.speed - 5.0).abs() < f64::EPSILON);
        assert_eq!(snap.eta, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_snapshot_clamps_and_finishes() {
        let snap = ProgressSnapshot::compute(150, 100, Duration::from_secs(1));
        assert!((snap.percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(snap.eta, None);
    }

    #[test]
    fn test_snapshot_without_elapsed_time_has_no_eta() {
        let snap = ProgressSnapshot::compute(0, 100, Duration::ZERO);
        assert!(snap.speed.abs() < f64::EPSILON);
        assert_eq!(snap.eta, None);

        let empty = ProgressSnapshot::compute(0, 0, Duration::from_secs(1));
        assert!((empty.percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counter_accumulates() {
        let progress = TransferProgress::new(10);
        progress.add(3);
        progress.add(4);
        assert_eq!(progress.seen(), 7);
        assert_eq!(progress.snapshot().total, 10);
    }
}
