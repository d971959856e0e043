use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ps_core::config::FloodConfig;
use ps_core::types::ClientQuery;
use ps_telemetry::metrics::{names, MetricsCollector};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodStatus {
    Normal { attempts: usize },
    LoopDetected { attempts: usize },
}

impl FloodStatus {
    pub fn is_loop(&self) -> bool {
        matches!(self, FloodStatus::LoopDetected { .. })
    }
}

/// Detects apps that reconnect in a tight loop.
///
/// Attempts are grouped by `os-device-app` and kept for a sliding window.
/// Reaching the threshold only reports; the connection is never refused.
#[derive(Debug)]
pub struct FloodGuard {
    window: Duration,
    threshold: usize,
    attempts: DashMap<String, VecDeque<Instant>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl FloodGuard {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            attempts: DashMap::new(),
            metrics: None,
        }
    }

    pub fn from_config(config: &FloodConfig) -> Self {
        Self::new(Duration::from_secs(config.window_secs), config.threshold)
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn record_attempt(&self, query: &ClientQuery) -> FloodStatus {
        self.record_attempt_at(&query.attempt_key(), Instant::now())
    }

    pub fn record_attempt_at(&self, key: &str, now: Instant) -> FloodStatus {
        let attempts = {
            let mut log = self.attempts.entry(key.to_string()).or_default();
            log.push_back(now);
            while log
                .front()
                .is_some_and(|first| now.saturating_duration_since(*first) > self.window)
            {
                log.pop_front();
            }
            log.len()
        };

        if attempts < self.threshold {
            return FloodStatus::Normal { attempts };
        }
        error!(
            key,
            attempts,
            window_secs = self.window.as_secs(),
            "reconnection loop detected, the app keeps reconnecting"
        );
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(names::CONNECTION_LOOPS_TOTAL, &[]);
        }
        FloodStatus::LoopDetected { attempts }
    }

    /// Attempts currently inside the window for `key`.
    pub fn attempts(&self, key: &str) -> usize {
        self.attempts.get(key).map(|log| log.len()).unwrap_or(0)
    }
}

impl Default for FloodGuard {
    fn default() -> Self {
        Self::from_config(&FloodConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "Android-Pixel-Demo";

    #[test]
    fn fourth_attempt_within_window_is_a_loop() {
        let metrics = Arc::new(MetricsCollector::new());
        let guard = FloodGuard::default().with_metrics(metrics.clone());
        let t = Instant::now();

        for offset in 0..3 {
            let status = guard.record_attempt_at(KEY, t + Duration::from_secs(offset));
            assert!(!status.is_loop());
        }
        let status = guard.record_attempt_at(KEY, t + Duration::from_secs(3));
        assert_eq!(status, FloodStatus::LoopDetected { attempts: 4 });
        assert_eq!(metrics.get_counter(names::CONNECTION_LOOPS_TOTAL, &[]), 1);
    }

    #[test]
    fn spaced_attempts_never_trigger() {
        let guard = FloodGuard::default();
        let t = Instant::now();
        for i in 0..10 {
            let status = guard.record_attempt_at(KEY, t + Duration::from_secs(21 * i));
            assert_eq!(status, FloodStatus::Normal { attempts: 1 });
        }
    }

    #[test]
    fn keys_are_independent() {
        let guard = FloodGuard::new(Duration::from_secs(20), 2);
        let t = Instant::now();
        guard.record_attempt_at("a", t);
        assert!(!guard.record_attempt_at("b", t).is_loop());
        assert!(guard.record_attempt_at("a", t).is_loop());
        assert_eq!(guard.attempts("b"), 1);
    }

    #[test]
    fn uses_query_attempt_key() {
        let guard = FloodGuard::default();
        let query = ClientQuery::new("Demo", "Android", "Pixel", "serial");
        guard.record_attempt(&query);
        assert_eq!(guard.attempts(KEY), 1);
    }
}
