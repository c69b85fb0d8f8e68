//! Endpoint registry and per-endpoint health metrics.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Normalized `scheme+host+port` key identifying one backend endpoint.
pub type EndpointKey = String;

pub fn endpoint_key(url: &str) -> EndpointKey {
    url.trim_end_matches('/').to_string()
}

/// Per-endpoint counters and timestamps feeding both the load balancer
/// (power-of-n, fade-in) and diagnostics. These are scheduling hints,
/// not authoritative health signals.
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    pub detected_time: Instant,
    pub in_flight: i64,
    pub last_seen: Instant,
    pub removed_at: Option<Instant>,
    latencies: Vec<Duration>,
}

impl EndpointMetrics {
    fn new(now: Instant) -> Self {
        Self { detected_time: now, in_flight: 0, last_seen: now, removed_at: None, latencies: Vec::new() }
    }

    pub fn record_latency(&mut self, d: Duration) {
        const MAX_SAMPLES: usize = 64;
        if self.latencies.len() >= MAX_SAMPLES {
            self.latencies.remove(0);
        }
        self.latencies.push(d);
    }

    pub fn p50_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort();
        Some(sorted[sorted.len() / 2])
    }
}

/// Worker-wide `endpoint-key -> EndpointMetrics` map. Entries are
/// created on first use and retained across route-table generations so
/// that fade-in state survives endpoint churn.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    inner: Rc<RefCell<HashMap<EndpointKey, EndpointMetrics>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint if absent, setting `detected_time` to now.
    /// Reappearance of a previously removed endpoint clears its removal
    /// mark, preserving the original `detected_time`.
    pub fn observe(&self, key: &str) {
        let mut map = self.inner.borrow_mut();
        let now = Instant::now();
        match map.get_mut(key) {
            Some(m) => {
                m.removed_at = None;
                m.last_seen = now;
            }
            None => {
                map.insert(key.to_string(), EndpointMetrics::new(now));
            }
        }
    }

    /// Mark an endpoint as no longer present in the live table. It stays
    /// registered until [`Self::sweep_expired`] removes it after the TTL.
    pub fn mark_removed(&self, key: &str) {
        if let Some(m) = self.inner.borrow_mut().get_mut(key) {
            m.removed_at = Some(Instant::now());
        }
    }

    pub fn sweep_expired(&self, ttl: Duration) {
        let now = Instant::now();
        self.inner.borrow_mut().retain(|_, m| match m.removed_at {
            Some(removed) => now.duration_since(removed) < ttl,
            None => true,
        });
    }

    pub fn keys(&self) -> Vec<EndpointKey> {
        self.inner.borrow().keys().cloned().collect()
    }

    pub fn detected_time(&self, key: &str) -> Option<Instant> {
        self.inner.borrow().get(key).map(|m| m.detected_time)
    }

    pub fn in_flight(&self, key: &str) -> i64 {
        self.inner.borrow().get(key).map(|m| m.in_flight).unwrap_or(0)
    }

    pub fn begin_request(&self, key: &str) {
        self.observe(key);
        if let Some(m) = self.inner.borrow_mut().get_mut(key) {
            m.in_flight += 1;
            m.last_seen = Instant::now();
        }
    }

    pub fn end_request(&self, key: &str, latency: Duration) {
        if let Some(m) = self.inner.borrow_mut().get_mut(key) {
            m.in_flight = (m.in_flight - 1).max(0);
            m.record_latency(latency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_in_flight_counter() {
        let reg = EndpointRegistry::new();
        reg.begin_request("http://a");
        reg.begin_request("http://a");
        assert_eq!(reg.in_flight("http://a"), 2);
        reg.end_request("http://a", Duration::from_millis(5));
        assert_eq!(reg.in_flight("http://a"), 1);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let reg = EndpointRegistry::new();
        reg.observe("http://a");
        reg.observe("http://b");
        reg.mark_removed("http://a");
        reg.sweep_expired(Duration::from_secs(0));
        assert!(reg.detected_time("http://a").is_none());
        assert!(reg.detected_time("http://b").is_some());
    }

    #[test]
    fn reappearance_clears_removed_mark_but_keeps_detected_time() {
        let reg = EndpointRegistry::new();
        reg.observe("http://a");
        let first = reg.detected_time("http://a").unwrap();
        reg.mark_removed("http://a");
        reg.observe("http://a");
        assert_eq!(reg.detected_time("http://a").unwrap(), first);
    }
}
