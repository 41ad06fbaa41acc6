//! Process-wide counters shown by `/status`, `/health` and `/stats`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct BotStats {
    started: Instant,
    uploads: AtomicU64,
    downloads: AtomicU64,
    active_transfers: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Default for BotStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BotStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            active_transfers: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_transfers(&self) -> u64 {
        self.active_transfers.load(Ordering::Relaxed)
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Counts a transfer as active for as long as the guard lives.
pub struct ActiveTransfer {
    stats: Arc<BotStats>,
}

impl ActiveTransfer {
    #[must_use]
    pub fn start(stats: &Arc<BotStats>) -> Self {
        stats.active_transfers.fetch_add(1, Ordering::Relaxed);
        Self {
            stats: Arc::clone(stats),
        }
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        self.stats.active_transfers.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_transfer_guard() {
        let stats = Arc::new(BotStats::new());
        {
            let _a = ActiveTransfer::start(&stats);
            let _b = ActiveTransfer::start(&stats);
            assert_eq!(stats.active_transfers(), 2);
        }
        assert_eq!(stats.active_transfers(), 0);
    }

    #[test]
    fn test_counters_and_last_error() {
        let stats = BotStats::new();
        stats.record_upload();
        stats.record_upload();
        stats.record_download();
        assert_eq!(stats.uploads(), 2);
        assert_eq!(stats.downloads(), 1);

        assert_eq!(stats.last_error(), None);
        stats.set_last_error("upload failed");
        assert_eq!(stats.last_error().as_deref(), Some("upload failed"));
    }
}
