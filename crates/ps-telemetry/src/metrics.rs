use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

/// Metric names recorded by the connection core.
pub mod names {
    pub const REQUEST_RESPONSE_DURATION: &str = "request_response_duration_seconds";
    pub const PLUGIN_REDUCER_DURATION: &str = "plugin_reducer_duration_seconds";
    pub const CALLS_TOTAL: &str = "calls_total";
    pub const FRAMES_DROPPED_TOTAL: &str = "frames_dropped_total";
    pub const DEVICE_ERRORS_TOTAL: &str = "device_errors_total";
    pub const CONNECTION_LOOPS_TOTAL: &str = "connection_loops_total";
    pub const CONNECTED_CLIENTS: &str = "connected_clients";
    pub const BOOTSTRAP_TOTAL: &str = "bootstrap_total";
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// A histogram that tracks the distribution of observed values across buckets.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    pub sum: AtomicU64,
    pub count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // Sum is stored as f64 bits.
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.sum.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Round-trip latency buckets (seconds), from sub-millisecond local calls
/// up to slow devices on a congested USB tunnel.
fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

/// Reducer buckets around the per-call background budget.
fn reducer_duration_buckets() -> Vec<f64> {
    vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs, used to distinguish
/// counter families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Format labels as `{key="value",key2="value2"}` for Prometheus output.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges and histograms shared by every component of one server.
///
/// Registration takes a write lock once per new series; updates afterwards
/// only take the read lock and touch atomics.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// Create a collector with the connection-core histograms registered.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        {
            let mut h = collector
                .histograms
                .write()
                .expect("metrics lock poisoned");
            h.insert(
                names::REQUEST_RESPONSE_DURATION.to_string(),
                Histogram::new(default_duration_buckets()),
            );
            h.insert(
                names::PLUGIN_REDUCER_DURATION.to_string(),
                Histogram::new(reducer_duration_buckets()),
            );
        }
        collector.set_gauge(names::CONNECTED_CLIENTS, 0);
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().expect("metrics lock poisoned");
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().expect("metrics lock poisoned");
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().expect("metrics lock poisoned");
        map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.with_gauge(name, |g| g.store(value, Ordering::Relaxed));
    }

    /// Add a (possibly negative) delta to a gauge.
    pub fn add_gauge(&self, name: &str, delta: i64) {
        self.with_gauge(name, |g| {
            g.fetch_add(delta, Ordering::Relaxed);
        });
    }

    fn with_gauge(&self, name: &str, f: impl FnOnce(&AtomicI64)) {
        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            if let Some(g) = map.get(name) {
                f(g);
                return;
            }
        }
        let mut map = self.gauges.write().expect("metrics lock poisoned");
        f(map.entry(name.to_string()).or_insert_with(|| AtomicI64::new(0)));
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        let map = self.gauges.read().expect("metrics lock poisoned");
        map.get(name).map(|g| g.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record a value into a histogram. If the histogram does not exist it is
    /// created with default duration buckets.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().expect("metrics lock poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    /// `(count, sum)` of a histogram, zero when it was never recorded.
    pub fn histogram_summary(&self, name: &str) -> (u64, f64) {
        let map = self.histograms.read().expect("metrics lock poisoned");
        map.get(name)
            .map(|h| (h.get_count(), h.get_sum()))
            .unwrap_or((0, 0.0))
    }

    // -- Export --------------------------------------------------------------

    /// Export all metrics in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().expect("metrics lock poisoned");
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&str> = grouped.keys().copied().collect();
            names.sort_unstable();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                let mut entries = grouped[name].clone();
                entries.sort_by_key(|(labels, _)| labels.prometheus_str());
                for (labels, value) in entries {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let val = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {} gauge\n", name));
                out.push_str(&format!("{} {}\n", name, val));
            }
        }

        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                // `observe` already counts a value into every bucket it fits,
                // so the per-bucket counts are cumulative.
                for (i, boundary) in h.buckets.iter().enumerate() {
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name,
                        boundary,
                        h.counts[i].load(Ordering::Relaxed)
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.get_count()));
                out.push_str(&format!("{}_sum {}\n", name, h.get_sum()));
                out.push_str(&format!("{}_count {}\n", name, h.get_count()));
            }
        }

        out
    }

    /// Export all metrics as a JSON value.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters_json = serde_json::Map::new();
        {
            let map = self.counters.read().expect("metrics lock poisoned");
            for ((name, labels), val) in map.iter() {
                let key = if labels.is_empty() {
                    name.clone()
                } else {
                    format!("{}{}", name, labels.prometheus_str())
                };
                counters_json.insert(key, serde_json::json!(val.load(Ordering::Relaxed)));
            }
        }

        let mut gauges_json = serde_json::Map::new();
        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            for (name, val) in map.iter() {
                gauges_json.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
            }
        }

        let mut histograms_json = serde_json::Map::new();
        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            for (name, h) in map.iter() {
                let buckets: Vec<serde_json::Value> = h
                    .buckets
                    .iter()
                    .enumerate()
                    .map(|(i, b)| {
                        serde_json::json!({
                            "le": b,
                            "count": h.counts[i].load(Ordering::Relaxed),
                        })
                    })
                    .collect();
                histograms_json.insert(
                    name.clone(),
                    serde_json::json!({
                        "buckets": buckets,
                        "sum": h.get_sum(),
                        "count": h.get_count(),
                    }),
                );
            }
        }

        serde_json::json!({
            "counters": counters_json,
            "gauges": gauges_json,
            "histograms": histograms_json,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(vec![0.01, 0.1, 1.0]);
        h.observe(0.005);
        h.observe(0.05);
        h.observe(5.0);
        let counts: Vec<u64> = h.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        assert_eq!(counts, vec![1, 2, 2]);
        assert_eq!(h.get_count(), 3);
    }

    #[test]
    fn defaults_register_core_histograms() {
        let m = MetricsCollector::with_defaults();
        let map = m.histograms.read().unwrap();
        assert!(map.contains_key(names::REQUEST_RESPONSE_DURATION));
        assert!(map.contains_key(names::PLUGIN_REDUCER_DURATION));
        drop(map);
        assert_eq!(m.get_gauge(names::CONNECTED_CLIENTS), 0);
    }

    #[test]
    fn gauge_add_moves_both_ways() {
        let m = MetricsCollector::new();
        m.add_gauge(names::CONNECTED_CLIENTS, 1);
        m.add_gauge(names::CONNECTED_CLIENTS, 1);
        m.add_gauge(names::CONNECTED_CLIENTS, -1);
        assert_eq!(m.get_gauge(names::CONNECTED_CLIENTS), 1);
    }

    #[test]
    fn labels_escape_quotes() {
        let l = Labels::new(&[("method", "a\"b")]);
        assert_eq!(l.prometheus_str(), "{method=\"a\\\"b\"}");
    }
}
