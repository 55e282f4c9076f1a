//! Per-key sliding-window rate limiting for the HTTP layer, independent of
//! the mix-request store proper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

pub struct RateLimiter {
    windows: DashMap<String, (u32, u64)>,
    #[allow(dead_code)]
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Returns `true` if the call for `key` is allowed under `limit` calls
    /// per `window_secs`.
    pub fn check(&self, key: &str, limit: u32, window_secs: u64) -> bool {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let now = now_epoch();
        let mut entry = self.windows.entry(key.to_string()).or_insert((0, now));
        let (count, window_start) = entry.value_mut();
        if now.saturating_sub(*window_start) >= window_secs {
            *count = 0;
            *window_start = now;
        }
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_blocks() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("k", 3, 60));
        }
        assert!(!limiter.check("k", 3, 60));
    }

    #[test]
    fn separate_keys_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("a", 1, 60));
        assert!(limiter.check("b", 1, 60));
        assert!(!limiter.check("a", 1, 60));
    }
}
