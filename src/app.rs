//! Shared application state
//!
//! One [`AppContext`] is built at startup and handed to both the Telegram
//! dispatcher and the HTTP server.

use crate::access::AccessList;
use crate::config::Settings;
use crate::rate_limit::RateLimiter;
use crate::registry::FileRegistry;
use crate::signing::StreamSigner;
use crate::stats::BotStats;
use crate::storage::StorageProvider;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

pub struct AppContext {
    pub settings: Arc<Settings>,
    pub storage: Arc<dyn StorageProvider>,
    pub registry: FileRegistry,
    pub limiter: RateLimiter,
    pub stats: Arc<BotStats>,
    pub access: AccessList,
    pub signer: StreamSigner,
    transfers: TaskTracker,
}

impl AppContext {
    #[must_use]
    pub fn new(settings: Arc<Settings>, storage: Arc<dyn StorageProvider>) -> Self {
        let limiter = RateLimiter::per_minute(settings.max_requests_per_minute);
        let access = AccessList::from_settings(&settings);
        let signer = StreamSigner::from_settings(&settings);
        Self {
            settings,
            storage,
            registry: FileRegistry::new(),
            limiter,
            stats: Arc::new(BotStats::new()),
            access,
            signer,
            transfers: TaskTracker::new(),
        }
    }

    /// Bucket name for display; empty when unset
    #[must_use]
    pub fn bucket(&self) -> &str {
        self.settings.wasabi_bucket.as_deref().unwrap_or_default()
    }

    /// Runs a transfer off the dispatcher so shutdown can wait for it.
    pub fn spawn_transfer<F>(&self, transfer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.transfers.spawn(transfer);
    }

    #[must_use]
    pub fn running_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// Waits up to `grace` for running transfers.
    ///
    /// Returns `false` if some were still running when the grace ran out.
    pub async fn drain_transfers(&self, grace: Duration) -> bool {
        self.transfers.close();
        tokio::time::timeout(grace, self.transfers.wait())
            .await
            .is_ok()
    }
}
