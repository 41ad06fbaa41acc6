//! Cooldown for "Unauthorized access" replies
//!
//! Strangers who keep sending files get one notice per cooldown period, so
//! the bot does not run into Telegram's flood limits answering them.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Remembers when each unauthorized user was last told off
#[derive(Clone)]
pub struct UnauthorizedCache {
    /// user_id -> time of the last notice; entries expire after the TTL
    cache: Cache<i64, Instant>,
    cooldown: Duration,
    silenced_count: Arc<AtomicU64>,
}

impl UnauthorizedCache {
    /// # Examples
    ///
    /// ```
    /// use oxide_wasabi::bot::UnauthorizedCache;
    ///
    /// let cache = UnauthorizedCache::new(
    ///     1200,   // 20 minutes cooldown
    ///     7200,   // 2 hours TTL
    ///     10_000  // max 10k entries
    /// );
    /// ```
    #[must_use]
    pub fn new(cooldown_secs: u64, ttl_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs.max(cooldown_secs)))
            .build();

        Self {
            cache,
            cooldown: Duration::from_secs(cooldown_secs),
            silenced_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Built from the `UNAUTHORIZED_*` environment knobs
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(
            crate::config::get_unauthorized_cooldown(),
            crate::config::get_unauthorized_cache_ttl(),
            crate::config::get_unauthorized_cache_max_size(),
        )
    }

    /// Returns `true` when the user has not been notified within the cooldown.
    ///
    /// Only every 100th silenced attempt is logged.
    pub async fn should_send(&self, user_id: i64, user_name: &str) -> bool {
        match self.cache.get(&user_id).await {
            Some(last) if last.elapsed() < self.cooldown => {}
            _ => return true,
        }

        let count = self.silenced_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(
                "⛔️ Silenced {} unauthorized attempts (recent: user {} - {})",
                count, user_id, user_name
            );
        }
        false
    }

    /// Starts the cooldown for `user_id`.
    pub async fn mark_sent(&self, user_id: i64) {
        self.cache.insert(user_id, Instant::now()).await;
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }
}
