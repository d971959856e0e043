use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ps_telemetry::metrics::{names, MetricsCollector};
use tracing::warn;

/// Background reducer budget per call.
pub const MAX_BACKGROUND_TASK_TIME: Duration = Duration::from_millis(25);

/// Reducer timing for one `plugin.method` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodStats {
    /// Total time spent in the reducer.
    pub cpu_time: Duration,
    pub messages: u64,
    /// Slowest single reducer call.
    pub max_time: Duration,
}

/// Diagnostic reducer statistics. Never affects delivery.
#[derive(Debug)]
pub struct BackgroundStats {
    stats: DashMap<String, MethodStats>,
    budget: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl BackgroundStats {
    pub fn new(budget: Duration) -> Self {
        Self {
            stats: DashMap::new(),
            budget,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn record(&self, plugin: &str, method: &str, elapsed: Duration) {
        let stat_name = format!("{plugin}.{method}");
        {
            let mut entry = self.stats.entry(stat_name.clone()).or_default();
            entry.cpu_time += elapsed;
            entry.messages += 1;
            entry.max_time = entry.max_time.max(elapsed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_histogram(names::PLUGIN_REDUCER_DURATION, elapsed.as_secs_f64());
        }
        if elapsed > self.budget {
            warn!(
                plugin = %stat_name,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.budget.as_millis() as u64,
                "plugin took too much time while handling a background message"
            );
        }
    }

    pub fn get(&self, plugin: &str, method: &str) -> Option<MethodStats> {
        self.stats.get(&format!("{plugin}.{method}")).map(|s| *s)
    }

    /// All entries, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, MethodStats)> {
        let mut all: Vec<(String, MethodStats)> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn reset(&self) {
        self.stats.clear();
    }
}

impl Default for BackgroundStats {
    fn default() -> Self {
        Self::new(MAX_BACKGROUND_TASK_TIME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_plugin_method() {
        let stats = BackgroundStats::default();
        stats.record("Network", "newRequest", Duration::from_millis(2));
        stats.record("Network", "newRequest", Duration::from_millis(5));
        stats.record("Network", "newResponse", Duration::from_millis(1));

        let s = stats.get("Network", "newRequest").unwrap();
        assert_eq!(s.messages, 2);
        assert_eq!(s.cpu_time, Duration::from_millis(7));
        assert_eq!(s.max_time, Duration::from_millis(5));
        assert_eq!(stats.snapshot().len(), 2);
        assert!(stats.get("Network", "other").is_none());
    }

    #[test]
    fn over_budget_is_only_recorded() {
        let metrics = Arc::new(MetricsCollector::with_defaults());
        let stats = BackgroundStats::new(Duration::from_millis(1)).with_metrics(metrics.clone());
        stats.record("Slow", "tick", Duration::from_millis(30));
        assert_eq!(stats.get("Slow", "tick").unwrap().messages, 1);
        assert_eq!(metrics.histogram_summary(names::PLUGIN_REDUCER_DURATION).0, 1);

        stats.reset();
        assert!(stats.snapshot().is_empty());
    }
}
