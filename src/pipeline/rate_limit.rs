use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RateLimit {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Sliding-window counter owned by one rate-limited target, keyed by caller.
///
/// Hits older than the window are evicted lazily when that caller is checked
/// again. Callers with no live hits are swept out at most once per window.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: RateLimit,
    hits: DashMap<String, VecDeque<Instant>>,
    last_sweep: Mutex<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            hits: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Records a hit for `caller` if it fits in the window. On rejection
    /// returns how long until the oldest hit leaves the window.
    pub fn try_acquire(&self, caller: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let window = self.limit.window();
        // Before taking the entry: the sweep locks every shard.
        self.sweep_if_due(now);
        let mut hits = self.hits.entry(caller.to_string()).or_default();

        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.limit.max_requests as usize {
            let retry_after = hits
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            return Err(retry_after);
        }

        hits.push_back(now);
        Ok(())
    }

    fn sweep_if_due(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if now.duration_since(*last) < self.limit.window() {
                return;
            }
            *last = now;
        }
        self.prune();
    }

    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.limit.window();
        self.hits.retain(|_, hits| {
            hits.retain(|hit| now.duration_since(*hit) < window);
            !hits.is_empty()
        });
    }

    pub fn tracked_callers(&self) -> usize {
        self.hits.len()
    }
}
