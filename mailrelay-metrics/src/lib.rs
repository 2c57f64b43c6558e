//! Delivery counters and per-sender submission limits.
//!
//! One [`Metrics`] value is created at startup and handed to every component
//! that records or checks anything, as an `Arc<Metrics>`. All state sits
//! behind a single mutex.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use mailrelay_common::{config::RateLimitConfig, internal};
use parking_lot::Mutex;
use serde::Serialize;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub recipients: u64,
    pub processing_time: Duration,
}

impl MetricsSnapshot {
    /// Mean processing time per completed job.
    pub fn average_processing_time(&self) -> Option<Duration> {
        u32::try_from(self.total)
            .ok()
            .filter(|&total| total > 0)
            .map(|total| self.processing_time / total)
    }
}

#[derive(Debug, Default)]
struct Inner {
    counters: MetricsSnapshot,
    /// Submission times per sender, oldest first, at most one day old.
    submissions: HashMap<String, VecDeque<Instant>>,
}

#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, recipients: usize, duration: Duration) {
        let mut inner = self.inner.lock();
        let counters = &mut inner.counters;

        counters.total += 1;
        counters.successful += 1;
        counters.recipients += recipients as u64;
        counters.processing_time += duration;
    }

    pub fn record_failure(&self, recipients: usize, duration: Duration) {
        let mut inner = self.inner.lock();
        let counters = &mut inner.counters;

        counters.total += 1;
        counters.failed += 1;
        counters.recipients += recipients as u64;
        counters.processing_time += duration;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().counters
    }

    /// Whether `sender` may submit another message right now.
    ///
    /// An allowed submission is recorded against both the hourly and the
    /// daily window. Always allows when limiting is disabled.
    pub fn check_rate_limit(&self, sender: &str, limits: &RateLimitConfig) -> bool {
        self.check_rate_limit_at(sender, limits, Instant::now())
    }

    pub fn check_rate_limit_at(
        &self,
        sender: &str,
        limits: &RateLimitConfig,
        now: Instant,
    ) -> bool {
        if !limits.enabled {
            return true;
        }

        let key = sender.to_ascii_lowercase();
        let mut inner = self.inner.lock();

        // Expire old submissions for every sender, forgetting idle ones.
        inner.submissions.retain(|_, window| {
            while window
                .front()
                .is_some_and(|&at| now.saturating_duration_since(at) >= DAY)
            {
                window.pop_front();
            }
            !window.is_empty()
        });

        let (last_hour, last_day) = inner.submissions.get(&key).map_or((0, 0), |window| {
            let last_hour = window
                .iter()
                .rev()
                .take_while(|&&at| now.saturating_duration_since(at) < HOUR)
                .count();
            (last_hour, window.len())
        });

        if last_hour >= limits.max_per_hour || last_day >= limits.max_per_day {
            drop(inner);
            internal!(level = WARN, "Rate limit exceeded for sender {sender}");
            return false;
        }

        inner.submissions.entry(key).or_default().push_back(now);
        true
    }
}
