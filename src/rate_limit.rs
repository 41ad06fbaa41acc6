//! Per-user sliding-window rate limiting

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Allows at most `max` requests per user within any `window`.
///
/// Rejected requests are not recorded, so a user that keeps retrying is
/// let through again as soon as the oldest accepted request ages out.
#[derive(Debug)]
pub struct RateLimiter {
    max: usize,
    window: Duration,
    requests: Mutex<HashMap<i64, VecDeque<Instant>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter with the usual one-minute window
    #[must_use]
    pub fn per_minute(max: usize) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    #[must_use]
    pub const fn max_requests(&self) -> usize {
        self.max
    }

    /// Returns `true` and records the request if the user is under the limit.
    pub fn check(&self, user_id: i64) -> bool {
        self.check_at(user_id, Instant::now())
    }

    /// [`check`](Self::check) at a given instant.
    ///
    /// Every call also drops users whose requests have all left the window.
    pub fn check_at(&self, user_id: i64, now: Instant) -> bool {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        requests.retain(|_, timestamps| {
            self.prune(timestamps, now);
            !timestamps.is_empty()
        });
        let timestamps = requests.entry(user_id).or_default();

        if timestamps.len() >= self.max {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while timestamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            timestamps.pop_front();
        }
    }

    /// Users with a request inside the current window
    #[must_use]
    pub fn tracked_users(&self) -> usize {
        self.tracked_users_at(Instant::now())
    }

    #[must_use]
    pub fn tracked_users_at(&self, now: Instant) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| {
                t.back()
                    .is_some_and(|last| now.saturating_duration_since(*last) < self.window)
            })
            .count()
    }

    /// Users whose latest request is newer than `within`
    #[must_use]
    pub fn active_users(&self, within: Duration) -> usize {
        let now = Instant::now();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| {
                t.back()
                    .is_some_and(|last| now.saturating_duration_since(*last) < within)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_after_limit_and_recovers() {
        let limiter = RateLimiter::per_minute(3);
        let start = Instant::now();

        for i in 0..3 {
            assert!(limiter.check_at(1, start + Duration::from_secs(i)));
        }
        assert!(!limiter.check_at(1, start + Duration::from_secs(10)));
        assert!(!limiter.check_at(1, start + Duration::from_secs(59)));

        // First request ages out at exactly 60s
        assert!(limiter.check_at(1, start + Duration::from_secs(60)));
        assert!(!limiter.check_at(1, start + Duration::from_secs(60)));
        assert!(limiter.check_at(1, start + Duration::from_secs(122)));
    }

    #[test]
    fn test_users_are_independent() {
        let limiter = RateLimiter::per_minute(1);
        let now = Instant::now();
        assert!(limiter.check_at(1, now));
        assert!(!limiter.check_at(1, now));
        assert!(limiter.check_at(2, now));
        assert_eq!(limiter.tracked_users(), 2);
    }

    #[test]
    fn test_expired_users_are_forgotten() {
        let limiter = RateLimiter::new(5, Duration::from_millis(50));
        let start = Instant::now();
        for user in 0..1000 {
            assert!(limiter.check_at(user, start));
        }
        assert_eq!(limiter.tracked_users_at(start), 1000);

        let later = start + Duration::from_millis(120);
        assert_eq!(limiter.tracked_users_at(later), 0);

        // The next request sweeps the stale entries out of the map
        assert!(limiter.check_at(5000, later));
        let stored = limiter.requests.lock().map(|r| r.len()).unwrap_or_default();
        assert_eq!(stored, 1);
        assert_eq!(limiter.tracked_users_at(later), 1);
    }

    #[test]
    fn test_active_users() {
        let limiter = RateLimiter::per_minute(5);
        assert!(limiter.check(7));
        assert_eq!(limiter.active_users(Duration::from_secs(300)), 1);
        assert_eq!(limiter.active_users(Duration::ZERO), 0);
    }
}
