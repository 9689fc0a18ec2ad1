use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Distribution of observed values across fixed bucket boundaries.
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
        // Sum is stored as f64 bits so it can be updated atomically.
        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let next = (f64::from_bits(current) + value).to_bits();
            if self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
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

/// Activation durations run seconds-to-minutes, unlike request latencies.
fn activation_duration_buckets() -> Vec<f64> {
    vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
}

fn call_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 60.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing counter families.
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

    fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Central collector for the coordinator and runner: counters for work
/// and error events, gauges for queue depth and leadership, histograms
/// for activation and tool-call durations.
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

    /// Collector pre-loaded with the standard warren histograms.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        {
            let mut h = collector.histograms.write().unwrap();
            h.insert(
                "activation_duration_seconds".to_string(),
                Histogram::new(activation_duration_buckets()),
            );
            h.insert(
                "llm_request_duration_seconds".to_string(),
                Histogram::new(call_duration_buckets()),
            );
            h.insert(
                "tool_call_duration_seconds".to_string(),
                Histogram::new(call_duration_buckets()),
            );
        }
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap();
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap();
        let c = map.entry(key).or_insert_with(|| AtomicU64::new(0));
        c.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().unwrap();
        map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = self.gauges.read().unwrap();
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().unwrap();
        let g = map
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0));
        g.store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        let map = self.gauges.read().unwrap();
        map.get(name).map(|g| g.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read().unwrap();
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().unwrap();
        let h = map
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(call_duration_buckets()));
        h.observe(value);
    }

    // -- Export -------------------------------------------------------------

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().unwrap();
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&&str> = grouped.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                for (labels, value) in &grouped[name] {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = self.gauges.read().unwrap();
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let val = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {} gauge\n", name));
                out.push_str(&format!("{} {}\n", name, val));
            }
        }

        {
            let map = self.histograms.read().unwrap();
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name, boundary, cumulative
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.get_count()));
                out.push_str(&format!("{}_sum {}\n", name, h.get_sum()));
                out.push_str(&format!("{}_count {}\n", name, h.get_count()));
            }
        }

        out
    }

    /// JSON snapshot, used by the health endpoint and tests.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters_json = serde_json::Map::new();
        {
            let map = self.counters.read().unwrap();
            for ((name, labels), val) in map.iter() {
                let key = if labels.0.is_empty() {
                    name.clone()
                } else {
                    format!("{}{}", name, labels.prometheus_str())
                };
                counters_json.insert(key, serde_json::json!(val.load(Ordering::Relaxed)));
            }
        }

        let mut gauges_json = serde_json::Map::new();
        {
            let map = self.gauges.read().unwrap();
            for (name, val) in map.iter() {
                gauges_json.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
            }
        }

        serde_json::json!({
            "counters": counters_json,
            "gauges": gauges_json,
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
    fn counter_increment_with_labels() {
        let m = MetricsCollector::new();
        m.increment_counter("activations_total", &[("outcome", "success")]);
        m.increment_counter("activations_total", &[("outcome", "success")]);
        m.increment_counter("activations_total", &[("outcome", "failure")]);

        assert_eq!(m.get_counter("activations_total", &[("outcome", "success")]), 2);
        assert_eq!(m.get_counter("activations_total", &[("outcome", "failure")]), 1);
        assert_eq!(m.get_counter("activations_total", &[("outcome", "other")]), 0);
    }

    #[test]
    fn counter_increment_by() {
        let m = MetricsCollector::new();
        m.increment_counter_by("llm_tokens_total", &[("direction", "in")], 150);
        m.increment_counter_by("llm_tokens_total", &[("direction", "in")], 50);
        assert_eq!(m.get_counter("llm_tokens_total", &[("direction", "in")]), 200);
    }

    #[test]
    fn gauge_set_and_overwrite() {
        let m = MetricsCollector::new();
        m.set_gauge("queue_depth_high", 5);
        assert_eq!(m.get_gauge("queue_depth_high"), 5);
        m.set_gauge("queue_depth_high", 0);
        assert_eq!(m.get_gauge("queue_depth_high"), 0);
    }

    #[test]
    fn histogram_records_into_default_buckets() {
        let m = MetricsCollector::with_defaults();
        m.record_histogram("activation_duration_seconds", 4.0);
        m.record_histogram("activation_duration_seconds", 45.0);

        let map = m.histograms.read().unwrap();
        let h = map.get("activation_duration_seconds").unwrap();
        assert_eq!(h.get_count(), 2);
        assert!((h.get_sum() - 49.0).abs() < 0.001);
    }

    #[test]
    fn prometheus_export_contains_families() {
        let m = MetricsCollector::new();
        m.increment_counter("work_enqueued_total", &[("priority", "high")]);
        m.set_gauge("is_leader", 1);
        m.record_histogram("tool_call_duration_seconds", 0.3);

        let out = m.export_prometheus();
        assert!(out.contains("# TYPE work_enqueued_total counter"));
        assert!(out.contains("work_enqueued_total{priority=\"high\"} 1"));
        assert!(out.contains("# TYPE is_leader gauge"));
        assert!(out.contains("is_leader 1"));
        assert!(out.contains("tool_call_duration_seconds_count 1"));
    }

    #[test]
    fn json_export_snapshot() {
        let m = MetricsCollector::new();
        m.increment_counter("errors_total", &[("kind", "TOOL_TIMEOUT")]);
        m.set_gauge("active_tasks", 3);

        let json = m.export_json();
        assert_eq!(json["gauges"]["active_tasks"], 3);
        assert_eq!(json["counters"]["errors_total{kind=\"TOOL_TIMEOUT\"}"], 1);
    }

    #[test]
    fn labels_sorted_for_stable_keys() {
        let a = Labels::new(&[("b", "2"), ("a", "1")]);
        let b = Labels::new(&[("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a.prometheus_str(), "{a=\"1\",b=\"2\"}");
        assert_eq!(Labels::empty().prometheus_str(), "");
    }
}
