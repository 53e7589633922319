//! Service counters and the bounded recent-error ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Maximum retained recent errors.
const ERROR_RING_CAPACITY: usize = 100;

/// Shared counter registry. All counters are monotonically increasing.
pub struct Metrics {
    price_updates: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    api_requests: AtomicU64,
    ws_connections: AtomicU64,
    events_received: AtomicU64,
    errors: Mutex<VecDeque<ErrorEntry>>,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub kind: String,
    pub message: String,
    pub timestamp: String,
}

/// Point-in-time snapshot returned by `get_stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub price_updates: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub api_requests: u64,
    pub ws_connections: u64,
    pub events_received: u64,
    pub error_count: usize,
    pub uptime_seconds: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            price_updates: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            api_requests: AtomicU64::new(0),
            ws_connections: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            errors: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
            started_at: Instant::now(),
        }
    }

    pub fn inc_price_updates(&self) {
        self.price_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_api_requests(&self) {
        self.api_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ws_connections(&self) {
        self.ws_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error into the bounded ring, evicting the oldest entry once
    /// the ring holds `ERROR_RING_CAPACITY` items.
    pub fn record_error(&self, kind: &str, message: impl Into<String>) {
        let mut ring = self.errors.lock().expect("error ring lock poisoned");
        if ring.len() == ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(ErrorEntry {
            kind: kind.to_string(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }

    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.errors
            .lock()
            .expect("error ring lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            price_updates: self.price_updates.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            api_requests: self.api_requests.load(Ordering::Relaxed),
            ws_connections: self.ws_connections.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            error_count: self.errors.lock().expect("error ring lock poisoned").len(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.inc_price_updates();
        m.inc_price_updates();
        m.inc_events_received();

        let stats = m.get_stats();
        assert_eq!(stats.price_updates, 2);
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.cache_hits, 0);
    }

    #[test]
    fn test_error_ring_is_bounded() {
        let m = Metrics::new();
        for i in 0..150 {
            m.record_error("test", format!("error {i}"));
        }
        let errors = m.recent_errors();
        assert_eq!(errors.len(), ERROR_RING_CAPACITY);
        // Oldest 50 were evicted.
        assert_eq!(errors[0].message, "error 50");
        assert_eq!(errors.last().unwrap().message, "error 149");
    }
}
