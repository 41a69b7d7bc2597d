use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::time::{Duration, Instant};

const DEFAULT_MAX_CLIENTS: usize = 10_000;
const MIN_INTERVAL: Duration = Duration::from_secs(1);
/// Entries idle for longer than this are dropped when the table fills up.
const STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: max 1 screenshot per second")]
    TooFrequent,
    #[error("Rate limiter capacity exceeded")]
    CapacityExceeded,
}

/// Per-client screenshot throttle: at most one upload per second per client id.
#[derive(Debug)]
pub struct ScreenshotRateLimiter {
    last_seen: Mutex<HashMap<String, Instant>>,
    max_clients: usize,
}

impl Default for ScreenshotRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS)
    }
}

impl ScreenshotRateLimiter {
    pub fn new(max_clients: usize) -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
            max_clients,
        }
    }

    pub fn check(&self, client_id: &str) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut table = self.last_seen.lock().expect("screenshot limiter poisoned");
        if let Some(last) = table.get(client_id) {
            if now.duration_since(*last) < MIN_INTERVAL {
                return Err(RateLimitError::TooFrequent);
            }
        } else if table.len() >= self.max_clients {
            table.retain(|_, seen| now.duration_since(*seen) < STALE_AFTER);
            if table.len() >= self.max_clients {
                return Err(RateLimitError::CapacityExceeded);
            }
        }
        table.insert(client_id.to_string(), now);
        Ok(())
    }

    /// Periodic cleanup; returns how many clients were forgotten.
    pub fn purge_stale(&self) -> usize {
        let now = Instant::now();
        let mut table = self.last_seen.lock().expect("screenshot limiter poisoned");
        let before = table.len();
        table.retain(|_, seen| now.duration_since(*seen) < STALE_AFTER);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.last_seen
            .lock()
            .expect("screenshot limiter poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_screenshot_per_second_per_client() {
        let limiter = ScreenshotRateLimiter::default();
        limiter.check("ext-a").expect("first");
        assert_eq!(limiter.check("ext-a"), Err(RateLimitError::TooFrequent));
        limiter.check("ext-b").expect("other client unaffected");
        tokio::time::advance(Duration::from_millis(1001)).await;
        limiter.check("ext-a").expect("after interval");
    }

    #[tokio::test(start_paused = true)]
    async fn full_table_evicts_stale_clients_before_refusing() {
        let limiter = ScreenshotRateLimiter::new(2);
        limiter.check("a").expect("a");
        limiter.check("b").expect("b");
        assert_eq!(limiter.check("c"), Err(RateLimitError::CapacityExceeded));

        tokio::time::advance(STALE_AFTER + Duration::from_secs(1)).await;
        limiter.check("c").expect("stale entries purged");
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_idle_clients() {
        let limiter = ScreenshotRateLimiter::default();
        limiter.check("a").expect("a");
        tokio::time::advance(STALE_AFTER * 2).await;
        assert_eq!(limiter.purge_stale(), 1);
    }
}
